//! Unit list loading (JSON lines).

use std::io::BufRead;
use std::path::Path;

use anyhow::Context;
use moldata_transfer::TransferUnit;

/// Reads units from `path`, or from stdin when `path` is `-`.
pub fn load(path: &Path) -> anyhow::Result<Vec<TransferUnit>> {
    if path == Path::new("-") {
        return parse(std::io::stdin().lock()).context("failed to read units from stdin");
    }
    let file = std::fs::File::open(path)
        .with_context(|| format!("failed to open unit list {}", path.display()))?;
    parse(std::io::BufReader::new(file))
        .with_context(|| format!("failed to read unit list {}", path.display()))
}

/// One JSON object per line; blank lines and `#` comments are ignored.
pub fn parse(reader: impl BufRead) -> anyhow::Result<Vec<TransferUnit>> {
    let mut units = Vec::new();
    for (i, line) in reader.lines().enumerate() {
        let line = line?;
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let unit: TransferUnit =
            serde_json::from_str(line).with_context(|| format!("line {}: invalid unit", i + 1))?;
        units.push(unit);
    }
    Ok(units)
}
