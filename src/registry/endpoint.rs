//! Per-endpoint model exposure.

use crate::config::ProviderConfig;

/// Whether `config` is exposed on the logical endpoint `endpoint_id`.
///
/// Endpoint ids are validated when the configuration is loaded, so an id
/// that is not in the set simply means "not exposed here".
pub fn is_available(config: &ProviderConfig, endpoint_id: &str) -> bool {
    config.available_endpoints.contains(endpoint_id)
}

/// Endpoints, other than `current`, where `config` can be reached.
///
/// Used to point clients at the right listener when a model is hidden on
/// the one they called.
pub fn alternative_endpoints(config: &ProviderConfig, current: &str) -> Vec<String> {
    let mut others: Vec<String> = config
        .available_endpoints
        .iter()
        .filter(|e| e.as_str() != current)
        .cloned()
        .collect();
    others.sort();
    others
}
