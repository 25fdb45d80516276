use std::fs;
use std::path::Path;

use crate::error::{Error, Result};

/// Highest valid PFN plus one: the maximum of `start_pfn + spanned` over all
/// memory zones reported by the kernel.
pub fn end_pfn(path: &Path) -> Result<u64> {
    let text = fs::read_to_string(path)
        .map_err(|e| Error::init(format!("failed to read '{}': {}", path.display(), e)))?;
    parse_end_pfn(&text)
        .ok_or_else(|| Error::init(format!("no memory zones found in '{}'", path.display())))
}

fn parse_end_pfn(text: &str) -> Option<u64> {
    let mut spanned = 0u64;
    let mut end: Option<u64> = None;
    for line in text.lines() {
        let mut fields = line.split_whitespace();
        match fields.next() {
            Some("spanned") => {
                spanned = fields.next().and_then(|v| v.parse().ok()).unwrap_or(0);
            }
            Some("start_pfn:") => {
                // each start_pfn closes the most recent spanned value
                if let Some(start) = fields.next().and_then(|v| v.parse::<u64>().ok()) {
                    let zone_end = start + spanned;
                    spanned = 0;
                    if Some(zone_end) > end {
                        end = Some(zone_end);
                    }
                }
            }
            _ => {}
        }
    }
    end.filter(|&e| e > 0)
}
