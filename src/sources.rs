//! `rag-backend sources`: print the catalog as a table.

use anyhow::Result;
use rag_backend_core::models::{SourceCatalog, SourceRecord};
use rag_backend_core::store::CatalogStore;

pub fn list_sources(catalog: &dyn CatalogStore) -> Result<()> {
    let catalog = catalog.load()?;
    print!("{}", render_table(&catalog));
    Ok(())
}

fn render_table(catalog: &SourceCatalog) -> String {
    let mut out = format!(
        "catalog version {} (updated {})\n",
        catalog.version,
        catalog.updated_at.format("%Y-%m-%d %H:%M:%S UTC")
    );
    out.push_str(&format!(
        "{:<20} {:<10} {:<20} {:>12} {:<8} INDEXED\n",
        "ALIAS", "TYPE", "STATUS", "BYTES", "LANG"
    ));
    for source in &catalog.sources {
        out.push_str(&format!(
            "{:<20} {:<10} {:<20} {:>12} {:<8} {}\n",
            source.alias,
            source.source_type.as_str(),
            source.status.as_str(),
            source.size_bytes,
            source.language,
            indexed(catalog, source)
        ));
    }
    if catalog.sources.is_empty() {
        out.push_str("(no sources registered)\n");
    }
    out
}

/// Whether the source's snapshot matches its current checksum.
fn indexed(catalog: &SourceCatalog, source: &SourceRecord) -> &'static str {
    match (catalog.snapshot_for(&source.alias), &source.checksum) {
        (Some(snapshot), Some(checksum)) if &snapshot.checksum == checksum => "yes",
        (Some(_), _) => "stale",
        (None, _) => "no",
    }
}
