//! Downstream collaborators: the item catalog and the document ledger.

use ::async_trait::async_trait;
use rfidgate_core::{
    BusinessDocument, DeliverySettings, DocumentDraft, DocumentKind, Item, RfidResult,
    StockIssueSettings, Timestamp,
};

/// Maximum length of a document's remarks after a submit appends to them.
pub const MAX_REMARKS_LEN: usize = 1000;

/// Read-only lookups for items, unit conversions and per-item booking
/// settings.
#[async_trait]
pub trait ItemCatalog: Send + Sync {
    async fn item(&self, item_code: &str) -> RfidResult<Option<Item>>;

    /// Factor converting one `uom` into the item's stock unit.
    async fn conversion_factor(&self, item_code: &str, uom: &str) -> RfidResult<Option<f64>>;

    async fn stock_issue_settings(&self, item_code: &str)
        -> RfidResult<Option<StockIssueSettings>>;

    async fn delivery_settings(&self, item_code: &str) -> RfidResult<Option<DeliverySettings>>;

    /// Every item's delivery settings, ordered by item code, at most `limit`.
    async fn delivery_settings_list(&self, limit: usize) -> RfidResult<Vec<DeliverySettings>>;
}

/// Stores stock issue and delivery documents.
#[async_trait]
pub trait DocumentLedger: Send + Sync {
    /// Persist a draft and assign it a name.
    async fn insert_draft(&self, draft: DocumentDraft) -> RfidResult<BusinessDocument>;

    async fn get(&self, kind: DocumentKind, name: &str) -> RfidResult<Option<BusinessDocument>>;

    /// Submit a document. A draft gets `posting_at` and `remark` appended
    /// (once) to its remarks. Submitting a submitted document is a no-op.
    /// Cancelled documents fail with `DocumentCancelled`; missing ones with
    /// `DocumentMissing`.
    async fn submit(
        &self,
        kind: DocumentKind,
        name: &str,
        remark: &str,
        posting_at: Timestamp,
    ) -> RfidResult<BusinessDocument>;
}

/// Append `line` to `remarks` unless already present, capped at
/// [`MAX_REMARKS_LEN`] chars.
pub fn append_remark(remarks: &str, line: &str) -> String {
    if remarks.contains(line) {
        return remarks.to_string();
    }
    let joined = if remarks.is_empty() {
        line.to_string()
    } else {
        format!("{}\n{}", remarks, line)
    };
    rfidgate_core::normalize::truncate_chars(&joined, MAX_REMARKS_LEN)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_append_remark_once() {
        let once = append_remark("RFID: EPC=AA", "consume: ANT=1 DEV=d");
        assert_eq!(once, "RFID: EPC=AA\nconsume: ANT=1 DEV=d");
        assert_eq!(append_remark(&once, "consume: ANT=1 DEV=d"), once);
        assert_eq!(append_remark("", "x"), "x");
    }

    #[test]
    fn test_append_remark_caps_length() {
        let long = "r".repeat(990);
        assert_eq!(append_remark(&long, &"l".repeat(50)).len(), MAX_REMARKS_LEN);
    }
}
