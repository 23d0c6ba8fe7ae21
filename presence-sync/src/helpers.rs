use rand::distr::{Alphanumeric, SampleString};
use rand::rng;
use std::time::{SystemTime, UNIX_EPOCH};

/// Random 18 character proxy id (uppercase letters and digits).
pub fn generate_proxy_id() -> String {
    Alphanumeric.sample_string(&mut rng(), 18).to_uppercase()
}

/// Current wall-clock time in epoch milliseconds.
pub fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or_default()
}
