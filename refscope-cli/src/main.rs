//! Reference Resolution Tracer - shows one render pass through the cache
//!
//! Usage: refscope-trace <entities.json> <id>...
//!
//! The JSON file holds an array of entities carrying `id` and `name`; it
//! stands in for the backend. All ids are read in one pass, so every
//! uncached id goes out in a single batched fetch.

use std::fs;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use refscope_cache::{init_tracing, ReferenceClient, ReferenceSlot, TelemetryConfig};
use refscope_core::{
    entity_id, FieldAdaptor, FnFetcher, ListResponse, ReferenceAdaptor, ReferenceConfig,
    ReferenceQuery, ResourceDescriptor, ScopeContext, ScopeTier,
};
use serde_json::Value;
use tracing::{error, info, warn};

fn load_universe(path: &str) -> Result<Vec<Value>, String> {
    let content = fs::read_to_string(path).map_err(|e| e.to_string())?;
    serde_json::from_str(&content).map_err(|e| e.to_string())
}

fn describe(slot: &ReferenceSlot<Value>) -> String {
    match slot.value() {
        Some(item) => format!("{} ({})", item.label, item.key),
        None => "<unresolved>".to_string(),
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    let args: Vec<String> = std::env::args().collect();
    if args.len() < 3 {
        eprintln!("Usage: refscope-trace <entities.json> <id>...");
        eprintln!();
        eprintln!("Example:");
        eprintln!("  refscope-trace projects.json p-1 p-2 p-9");
        std::process::exit(1);
    }

    let telemetry = TelemetryConfig::from_env().with_directive("refscope_trace=info");
    if let Err(e) = init_tracing(&telemetry) {
        eprintln!("Logging disabled: {}", e);
    }

    let universe = match load_universe(&args[1]) {
        Ok(universe) => Arc::new(universe),
        Err(e) => {
            error!(path = %args[1], error = %e, "Failed to load entities");
            std::process::exit(1);
        }
    };
    info!(path = %args[1], count = universe.len(), "Loaded entities");

    let calls = Arc::new(AtomicUsize::new(0));
    let fetcher = {
        let universe = Arc::clone(&universe);
        let calls = Arc::clone(&calls);
        FnFetcher::new(move |query: ReferenceQuery| {
            let universe = Arc::clone(&universe);
            let calls = Arc::clone(&calls);
            async move {
                let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                let results: Vec<Value> = match query.requested_ids() {
                    Some(ids) => universe
                        .iter()
                        .filter(|e| entity_id(e, "id").map(|id| ids.contains(&id)).unwrap_or(false))
                        .cloned()
                        .collect(),
                    None => universe.to_vec(),
                };
                info!(
                    call = n,
                    requested = ?query.requested_ids().unwrap_or(&[]),
                    returned = results.len(),
                    "Fetch issued"
                );
                Ok(ListResponse::new(results))
            }
        })
    };

    let config = ReferenceConfig::from_env();
    let settle_after = config.flush_delay + Duration::from_millis(50);
    let client = match ReferenceClient::in_memory(config) {
        Ok(client) => client,
        Err(e) => {
            error!(error = %e, "Invalid configuration");
            std::process::exit(1);
        }
    };
    client.set_scope(ScopeContext::new().with_domain("local"));

    let descriptor = ResourceDescriptor::new("entity", "id", "Entity").with_tiers(&[ScopeTier::Domain]);
    let adaptor: Arc<dyn ReferenceAdaptor<Value>> = Arc::new(FieldAdaptor::new("id", "name"));
    let consumer = client.subscriptions().consumer();
    let handle = client.reference(&descriptor, Arc::new(fetcher), adaptor, consumer);

    println!("render pass:");
    let slots: Vec<ReferenceSlot<Value>> = args[2..].iter().map(|id| handle.map.get(id)).collect();
    for slot in &slots {
        println!("  {} -> {}", slot.id(), describe(slot));
    }

    tokio::time::sleep(settle_after).await;

    println!("after flush:");
    for slot in &slots {
        println!("  {} -> {}", slot.id(), describe(slot));
    }
    println!("fetch calls: {}", calls.load(Ordering::SeqCst));

    let unresolved = slots.iter().filter(|slot| !slot.is_resolved()).count();
    if unresolved > 0 {
        warn!(count = unresolved, "Some ids did not resolve");
    }
    client.dispose(consumer);
}
