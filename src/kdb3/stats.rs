use std::time::Duration;

/// Timings and sizes recorded while loading a database.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PerformanceStatistics {
    pub load_time: Duration,
    pub key_transform_time: Duration,
    pub decryption_time: Duration,
    pub content_hash_time: Duration,
    pub content_extraction_time: Duration,

    pub encrypted_content_len: usize,
    pub plain_content_len: usize,
}
