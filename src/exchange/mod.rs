pub mod adapter;
pub mod binance;
pub mod bybit;
pub mod paper;
pub mod registry;
pub mod stats;
pub mod stream;
pub mod ws;

use chrono::{DateTime, TimeZone, Utc};
use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::exchange::adapter::{ExchangeError, ExchangeResult};

pub use adapter::{ExchangeAdapter, PermanentKind, TransientKind};
pub use binance::BinanceAdapter;
pub use bybit::BybitAdapter;
pub use paper::PaperAdapter;
pub use registry::{ExchangeRegistry, RegistryError, SharedAdapter};
pub use stream::MarketStream;

type HmacSha256 = Hmac<Sha256>;

/// Hex-encoded HMAC-SHA256, the signature scheme both REST venues use.
pub(crate) fn sign_hmac_sha256(secret: &str, payload: &str) -> ExchangeResult<String> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|e| ExchangeError::Configuration(format!("bad signing key: {}", e)))?;
    mac.update(payload.as_bytes());
    Ok(hex::encode(mac.finalize().into_bytes()))
}

/// Venue timestamps are epoch milliseconds; out-of-range values fall back to now.
pub(crate) fn utc_from_millis(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms).single().unwrap_or_else(Utc::now)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hmac_known_vector() {
        // Example from the Binance signed-endpoint documentation.
        let secret = "NhqPtmdSJYdKjVHjA7PZj4Mge3R5YNiP1e3UZjInClVN65XAbvqqM6A7H5fATj0j";
        let payload = "symbol=LTCBTC&side=BUY&type=LIMIT&timeInForce=GTC&quantity=1&price=0.1&recvWindow=5000&timestamp=1499827319559";
        assert_eq!(
            sign_hmac_sha256(secret, payload).unwrap(),
            "c8db56825ae71d6d79447849e617115f4a920fa2acdcab2b053c4b2838bd6b71"
        );
    }

    #[test]
    fn test_millis_conversion() {
        assert_eq!(utc_from_millis(0).timestamp(), 0);
        assert_eq!(utc_from_millis(1_700_000_000_123).timestamp_subsec_millis(), 123);
    }
}
