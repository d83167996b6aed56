//! Pagination helpers over record collections
//!
//! List queries are capped at `MAX_PAGE_SIZE` rows, so any bulk scan must
//! walk pages. Bulk deletion cannot walk pages forward (removing rows
//! shifts every later page), so it drains the first page instead.

use crate::store::{Collection, Filter, Record};
use bunkreq_common::Result;
use serde::Serialize;
use std::collections::HashSet;
use std::future::Future;

/// Number of pages needed for `total` rows
pub fn total_pages(total: u64, per_page: u32) -> u32 {
    let per_page = per_page.max(1) as u64;
    ((total + per_page - 1) / per_page) as u32
}

/// Read every record matching `filter`, page by page
pub async fn list_all(
    collection: &Collection,
    filter: Option<&Filter>,
    per_page: u32,
) -> Result<Vec<Record>> {
    let mut records = Vec::new();
    let mut page = 1;

    loop {
        let result = collection.list(filter, page, per_page).await?;
        let fetched = result.items.len();
        records.extend(result.items);

        if fetched == 0 || records.len() as u64 >= result.total {
            break;
        }
        page += 1;
    }

    Ok(records)
}

/// Outcome of a drain
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DrainReport {
    pub processed: usize,
    /// Ids whose action failed; they are left in place
    pub failed: Vec<String>,
}

/// Apply `action` to every record matching `filter`, where the action is
/// expected to remove the record from the matching set (usually a delete).
///
/// **Algorithm:**
/// 1. Read the current page (starting at page 1)
/// 2. Apply the action to each record not yet seen
/// 3. If anything on the page succeeded, re-read the same page
/// 4. If every record on the page had failed or was already seen, move to
///    the next page (only failed rows sit in front of it)
/// 5. Stop when a page comes back empty
///
/// A failed action is logged and recorded, never aborting the drain.
pub async fn drain_matching<F, Fut>(
    collection: &Collection,
    filter: &Filter,
    per_page: u32,
    mut action: F,
) -> Result<DrainReport>
where
    F: FnMut(Record) -> Fut,
    Fut: Future<Output = Result<()>>,
{
    let mut report = DrainReport::default();
    let mut seen: HashSet<String> = HashSet::new();
    let mut page = 1;

    loop {
        let result = collection.list(Some(filter), page, per_page).await?;
        if result.items.is_empty() {
            break;
        }

        let mut progressed = false;
        for record in result.items {
            if !seen.insert(record.id.clone()) {
                continue;
            }
            let id = record.id.clone();
            match action(record).await {
                Ok(()) => {
                    report.processed += 1;
                    progressed = true;
                }
                Err(e) => {
                    tracing::warn!(
                        collection = collection.name(),
                        id = %id,
                        error = %e,
                        "Drain action failed, leaving record in place"
                    );
                    report.failed.push(id);
                }
            }
        }

        if !progressed {
            page += 1;
        }
    }

    tracing::debug!(
        collection = collection.name(),
        processed = report.processed,
        failed = report.failed.len(),
        "Drain complete"
    );
    Ok(report)
}
