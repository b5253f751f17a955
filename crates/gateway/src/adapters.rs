use exgate_core::{Platform, ProtocolAdapter};
use exgate_exchanges_binance::BinanceAdapter;
use exgate_exchanges_btcc::BtccAdapter;
use std::sync::Arc;

/// The protocol adapter for a platform. The only place platforms are matched on.
pub fn adapter_for(platform: Platform) -> Arc<dyn ProtocolAdapter> {
    match platform {
        Platform::Binance => Arc::new(BinanceAdapter::new()),
        Platform::Btcc => Arc::new(BtccAdapter::new()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use exgate_core::ProtocolStyle;

    #[test]
    fn test_every_platform_has_an_adapter() {
        for platform in Platform::ALL {
            assert_eq!(adapter_for(platform).platform(), platform);
        }
        assert_eq!(
            adapter_for(Platform::Binance).style(),
            ProtocolStyle::StatelessReconnect
        );
        assert_eq!(adapter_for(Platform::Btcc).style(), ProtocolStyle::PersistentRpc);
    }
}
