use std::io::{self, Write};

use serde::Serialize;

use crate::domain::Schema;
use crate::walker::IngestReport;

pub struct JsonOutput;

impl JsonOutput {
    pub fn print_reports(reports: &[IngestReport]) -> io::Result<()> {
        Self::print_json(&reports)
    }

    pub fn print_schemas(schemas: &[Schema]) -> io::Result<()> {
        Self::print_json(&schemas)
    }

    fn print_json<T: Serialize>(value: &T) -> io::Result<()> {
        let json = serde_json::to_string_pretty(value).map_err(io::Error::other)?;
        let mut stdout = io::stdout();
        stdout.write_all(json.as_bytes())?;
        stdout.write_all(b"\n")?;
        Ok(())
    }
}
