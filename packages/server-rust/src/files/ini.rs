//! Two-pass callback INI reader.
//!
//! The reader walks a file twice: pass 0 lets the handler size its
//! allocations, pass 1 populates them. Syntax errors carry the file line
//! number. Section and key names are folded to lower case; values keep
//! their spelling.

use std::path::Path;

use iclaustron_core::error::{IcError, IcResult};

/// Sizing pass.
pub const PASS_SIZE: u32 = 0;
/// Population pass.
pub const PASS_FILL: u32 = 1;

/// Callbacks invoked by the reader, once per pass.
pub trait IniHandler {
    /// Called before each pass starts.
    fn init(&mut self, _pass: u32) -> IcResult<()> {
        Ok(())
    }

    /// A `[section]` header.
    fn add_section(&mut self, name: &str, pass: u32, line: u32) -> IcResult<()>;

    /// A `key = value` assignment inside the current section.
    fn add_key(&mut self, key: &str, value: &str, pass: u32, line: u32) -> IcResult<()>;

    /// A comment line (`#` or `;`).
    fn add_comment(&mut self, _comment: &str, _pass: u32, _line: u32) -> IcResult<()> {
        Ok(())
    }

    /// Called after each pass completes, before `init` of the next.
    fn verify(&mut self, _pass: u32) -> IcResult<()> {
        Ok(())
    }

    /// Called once after the final pass.
    fn end(&mut self) -> IcResult<()> {
        Ok(())
    }
}

/// Runs both passes over in-memory content.
pub fn parse_ini_str<H: IniHandler>(content: &str, handler: &mut H) -> IcResult<()> {
    for pass in [PASS_SIZE, PASS_FILL] {
        handler.init(pass)?;
        run_pass(content, handler, pass)?;
        handler.verify(pass)?;
    }
    handler.end()
}

/// Reads a file and runs both passes over it.
pub fn parse_ini_file<H: IniHandler>(path: &Path, handler: &mut H) -> IcResult<()> {
    let content = std::fs::read_to_string(path).map_err(|_| IcError::FailedToOpenFile {
        path: path.display().to_string(),
    })?;
    parse_ini_str(&content, handler)
}

fn run_pass<H: IniHandler>(content: &str, handler: &mut H, pass: u32) -> IcResult<()> {
    for (index, raw_line) in content.lines().enumerate() {
        let line_number = index as u32 + 1;
        let line = raw_line.trim();
        if line.is_empty() {
            continue;
        }
        if line.starts_with('#') || line.starts_with(';') {
            handler.add_comment(line, pass, line_number)?;
            continue;
        }
        if let Some(rest) = line.strip_prefix('[') {
            let Some(name) = rest.strip_suffix(']') else {
                return Err(IcError::ProtocolError { line: line_number });
            };
            let name = name.trim().to_lowercase();
            if name.is_empty() {
                return Err(IcError::ProtocolError { line: line_number });
            }
            handler.add_section(&name, pass, line_number)?;
            continue;
        }
        let Some((key, value)) = line.split_once('=') else {
            return Err(IcError::ProtocolError { line: line_number });
        };
        let key = key.trim().to_lowercase();
        let value = value.trim();
        if key.is_empty() || value.is_empty() {
            return Err(IcError::ProtocolError { line: line_number });
        }
        handler.add_key(&key, value, pass, line_number)?;
    }
    Ok(())
}
