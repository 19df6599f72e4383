/// Row type for the `transfers` table. The record itself is stored as JSON;
/// the other columns exist for indexing and listing.

pub struct TransferRow {
    pub id: String,
    pub status: String,
    pub record_json: String,
    pub checksum: String,
}

pub fn checksum(record_json: &str) -> String {
    use sha2::{Digest, Sha256};
    hex::encode(Sha256::digest(record_json.as_bytes()))
}
