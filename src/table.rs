//! Console table theme
//!
//! One place for the table styling used by info, discover, and the bulk
//! power commands: rounded borders, uppercase headers, left alignment.

use tabled::{
    Table,
    settings::{Alignment, Modify, Style, format::Format, object::{Columns, Rows}},
};

/// Apply the shared theme to a table
pub fn themed(mut table: Table) -> Table {
    table
        .with(Style::rounded())
        .with(Modify::new(Rows::first()).with(Format::content(|s| s.to_uppercase())))
        .with(Modify::new(Columns::new(..)).with(Alignment::left()));
    table
}
