pub mod schema;

pub use schema::{
    AuthConfig, Config, DemoConfig, GatewayConfig, HistoryConfig, IngestionConfig,
    ProviderConfig, SessionsConfig, StorageConfig, StreamConfig,
};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reexported_config_default_is_constructible() {
        let config = Config::default();

        assert!(!config.provider.model.is_empty());
        assert!(config.provider.temperature > 0.0);
        assert!(config.gateway.port > 0);
    }
}
