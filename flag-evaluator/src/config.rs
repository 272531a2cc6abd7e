use envconfig::Envconfig;

#[derive(Envconfig, Clone)]
pub struct Config {
    #[envconfig(default = "production")]
    pub environment: String,

    #[envconfig(default = "redis://localhost:6379/")]
    pub redis_url: String,

    #[envconfig(default = "60")]
    pub cache_ttl_secs: u64,

    // A slow store must never stall a request path; expiry resolves to the
    // fail-closed default.
    #[envconfig(default = "2000")]
    pub evaluation_deadline_ms: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults() {
        let config = Config::init_from_hashmap(&HashMap::new()).unwrap();
        assert_eq!(config.environment, "production");
        assert_eq!(config.cache_ttl_secs, 60);
        assert_eq!(config.evaluation_deadline_ms, 2000);
    }

    #[test]
    fn test_environment_is_overridable() {
        let vars = HashMap::from([("ENVIRONMENT".to_string(), "staging".to_string())]);
        let config = Config::init_from_hashmap(&vars).unwrap();
        assert_eq!(config.environment, "staging");
    }
}
