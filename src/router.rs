//! Router & load balancer (C5)
//!
//! Primary path: hash the routing key onto the consistent-hash ring
//! carried by the current registry generation. If the primary pick
//! fails any precondition (doesn't declare the method/tool, unhealthy,
//! circuit without capacity), fall back to Power of Two Choices among
//! the remaining serviceable, declaring backends.

use rand::seq::IteratorRandom;

use crate::error::RouterError;
use crate::health::HealthManager;
use crate::registry::RegistryGeneration;

/// Derive the routing key for a request
pub fn routing_key(method: &str, tool_name: Option<&str>) -> String {
    match method {
        "tools/call" | "tools/schema" => tool_name.unwrap_or(method).to_string(),
        "tools/list" | "resources/list" | "prompts/list" => format!("__fanout__:{method}"),
        other => other.to_string(),
    }
}

/// Pick a backend id to serve `key` for `method`.
pub fn select_backend(
    generation: &RegistryGeneration,
    health: &HealthManager,
    method: &str,
    key: &str,
) -> Result<String, RouterError> {
    if let Some(primary) = generation.ring.lookup(key)
        && precondition_ok(generation, health, primary, method)
    {
        return Ok(primary.to_string());
    }

    let candidates: Vec<&str> = generation
        .declaring(method_or_key(method, key))
        .into_iter()
        .map(|d| d.id.as_str())
        .filter(|id| precondition_ok(generation, health, id, method))
        .collect();

    if candidates.is_empty() {
        return Err(RouterError::NoBackendAvailable);
    }
    if candidates.len() == 1 {
        return Ok(candidates[0].to_string());
    }

    power_of_two_choices(&candidates, health)
}

/// For the declaring-backend lookup we want to match against the tool
/// name/method, not the synthetic fan-out key.
fn method_or_key<'a>(method: &'a str, key: &'a str) -> &'a str {
    if key.starts_with("__fanout__:") {
        method
    } else {
        key
    }
}

fn precondition_ok(generation: &RegistryGeneration, health: &HealthManager, backend_id: &str, method: &str) -> bool {
    let Some(descriptor) = generation.get(backend_id) else {
        return false;
    };
    let declares = descriptor.tool_name_patterns.is_empty()
        || generation.declaring(method).iter().any(|d| d.id == backend_id);
    if !declares {
        return false;
    }
    health.get(backend_id).map(|h| h.is_serviceable()).unwrap_or(false)
}

fn power_of_two_choices(candidates: &[&str], health: &HealthManager) -> Result<String, RouterError> {
    let mut rng = rand::rng();
    let mut sample: Vec<&str> = candidates.iter().copied().choose_multiple(&mut rng, 2);
    if sample.is_empty() {
        return Err(RouterError::NoBackendAvailable);
    }
    if sample.len() == 1 {
        return Ok(sample.remove(0).to_string());
    }

    let (a, b) = (sample[0], sample[1]);
    let load_a = health.get(a).map(|h| h.in_flight()).unwrap_or(u32::MAX);
    let load_b = health.get(b).map(|h| h.in_flight()).unwrap_or(u32::MAX);

    let winner = match load_a.cmp(&load_b) {
        std::cmp::Ordering::Less => a,
        std::cmp::Ordering::Greater => b,
        std::cmp::Ordering::Equal => {
            let lat_a = health.get(a).map(|h| h.latency_ewma()).unwrap_or_default();
            let lat_b = health.get(b).map(|h| h.latency_ewma()).unwrap_or_default();
            if lat_a <= lat_b { a } else { b }
        }
    };
    Ok(winner.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CircuitBreakerConfig, HealthConfig};
    use crate::registry::{BackendDescriptor, Endpoint};
    use crate::registry::hashring::HashRing;
    use std::collections::HashMap;
    use std::sync::Arc;
    use std::time::Duration;

    fn descriptor(id: &str) -> BackendDescriptor {
        BackendDescriptor {
            id: id.to_string(),
            name: id.to_string(),
            transport: crate::config::Transport::Stdio,
            endpoint: Endpoint::Command {
                command: "echo".to_string(),
                args: vec![],
                env: HashMap::new(),
                cwd: None,
            },
            timeout: Duration::from_secs(30),
            tool_name_patterns: vec![],
            priority: 0,
            idempotent_methods: vec![],
            batchable_methods: vec![],
        }
    }

    fn generation(ids: &[&str]) -> RegistryGeneration {
        let mut ring = HashRing::new(160);
        let mut backends = HashMap::new();
        for id in ids {
            ring.add_backend(id);
            backends.insert(id.to_string(), Arc::new(descriptor(id)));
        }
        RegistryGeneration {
            version: 1,
            backends,
            ring,
            installed_at: std::time::Instant::now(),
        }
    }

    fn healthy_manager(ids: &[&str]) -> HealthManager {
        let manager = HealthManager::new();
        for id in ids {
            manager.insert(id, HealthConfig::default(), CircuitBreakerConfig::default());
            manager.get(id).unwrap().record_outcome(true, Duration::from_millis(1));
        }
        manager
    }

    #[test]
    fn routing_key_uses_tool_name_for_calls() {
        assert_eq!(routing_key("tools/call", Some("fs.read")), "fs.read");
    }

    #[test]
    fn routing_key_is_synthetic_for_listings() {
        assert_eq!(routing_key("tools/list", None), "__fanout__:tools/list");
    }

    #[test]
    fn single_backend_always_wins() {
        let gen = generation(&["only"]);
        let health = healthy_manager(&["only"]);
        let picked = select_backend(&gen, &health, "tools/call", "fs.read").unwrap();
        assert_eq!(picked, "only");
    }

    #[test]
    fn empty_registry_returns_no_backend_available() {
        let gen = generation(&[]);
        let health = HealthManager::new();
        let err = select_backend(&gen, &health, "tools/call", "fs.read").unwrap_err();
        assert_eq!(err, RouterError::NoBackendAvailable);
    }

    #[test]
    fn unserviceable_primary_falls_back_to_other_backend() {
        let gen = generation(&["a", "b"]);
        let health = HealthManager::new();
        health.insert("a", HealthConfig::default(), CircuitBreakerConfig::default());
        health.insert("b", HealthConfig::default(), CircuitBreakerConfig::default());
        // "a" never recorded a success so stays Unknown -> unserviceable.
        health.get("b").unwrap().record_outcome(true, Duration::from_millis(1));
        let picked = select_backend(&gen, &health, "tools/call", "fs.read").unwrap();
        assert_eq!(picked, "b");
    }
}
