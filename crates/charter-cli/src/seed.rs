use std::collections::HashSet;
use std::path::Path;

use anyhow::{Context, Result};
use charter_crawler::SeedItem;
use serde::Deserialize;

// One row of the seed CSV; columns beyond these are ignored.
#[derive(Debug, Deserialize)]
struct SchoolRow {
    cds_code: String,
    #[serde(default)]
    website: String,
}

/// Load the seed list: rows without a website are skipped, repeated
/// cds codes keep their first row.
pub fn load_seeds(path: &Path) -> Result<Vec<SeedItem>> {
    let mut reader =
        csv::Reader::from_path(path).with_context(|| format!("opening {}", path.display()))?;

    let mut seeds = Vec::new();
    let mut seen = HashSet::new();
    let mut skipped = 0usize;
    for row in reader.deserialize() {
        let row: SchoolRow = row.with_context(|| format!("reading {}", path.display()))?;
        let website = row.website.trim();
        if website.is_empty() {
            skipped += 1;
            continue;
        }
        if !seen.insert(row.cds_code.clone()) {
            continue;
        }
        seeds.push(SeedItem {
            id: row.cds_code,
            url: website.to_string(),
        });
    }
    if skipped > 0 {
        log::info!("{skipped} rows without a website skipped");
    }
    Ok(seeds)
}
