//! Integration tests for the client pipeline
//!
//! Drives typed endpoints through a `Client` backed by `MockTransport` and a
//! manual clock, and checks cache, middleware, event and state behavior as a
//! caller sees it.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)] // Test code can use unwrap/expect/panic

use apiflow_core::event::{Event, EventKind};
use apiflow_core::middleware::{ErrorOutcome, MiddlewareError, MiddlewareOptions};
use apiflow_core::state::{EndpointState, EndpointStatus};
use apiflow_core::{ApiError, ExecutionOptions, RequestDescription, RequestError, ResultEnvelope};
use apiflow_runtime::{
    CachePolicy, Client, ClientConfig, EndpointConfig, FnMiddleware, RetryMiddleware, RetryPolicy, StorageType,
};
use apiflow_testing::{FailingStore, ManualClock, MockTransport, Recorder, init_tracing};
use serde::Deserialize;
use serde_json::{Value, json};
use std::sync::{Arc, Mutex};
use std::time::Duration;

// ============================================================================
// Test Fixtures
// ============================================================================

#[derive(Debug, Clone, PartialEq, Deserialize)]
struct User {
    id: u64,
    name: String,
}

fn user_envelope() -> ResultEnvelope {
    ResultEnvelope::success(200, json!({ "id": 1, "name": "Ada" }))
}

fn get_user() -> EndpointConfig<u64> {
    EndpointConfig::new(|id: &u64| RequestDescription::get(format!("/users/{id}")))
}

fn client_with_clock(transport: &MockTransport, clock: &ManualClock) -> Client {
    init_tracing();
    Client::builder(ClientConfig::default(), transport.clone())
        .with_clock(Arc::new(clock.clone()))
        .build()
}

fn kinds(events: &[Event]) -> Vec<EventKind> {
    events.iter().map(|event| event.kind).collect()
}

// ============================================================================
// Cache
// ============================================================================

#[tokio::test]
async fn test_get_user_hits_cache_until_ttl_expires() {
    let transport = MockTransport::new().respond_with(user_envelope());
    let clock = ManualClock::new();
    let client = client_with_clock(&transport, &clock);
    let events = Recorder::<Event>::new();
    let _subscription = client.subscribe_all(events.listener());

    let endpoint = client.create_endpoint::<u64, User>(
        "getUser",
        get_user().with_cache(CachePolicy::ttl(Duration::from_millis(1000))),
    );

    let first = endpoint.fetch(&1, ExecutionOptions::new()).await.unwrap();
    assert_eq!(first.name, "Ada");
    assert_eq!(transport.call_count(), 1);
    assert_eq!(
        kinds(&events.values()),
        vec![EventKind::RequestStart, EventKind::CacheMiss, EventKind::RequestSuccess]
    );

    let second = endpoint.fetch(&1, ExecutionOptions::new()).await.unwrap();
    assert_eq!(second, first);
    assert_eq!(transport.call_count(), 1, "Cache hit must not reach the transport");
    assert_eq!(
        kinds(&events.values())[3..],
        [EventKind::RequestStart, EventKind::CacheHit]
    );
    assert!(endpoint.state().meta.from_cache);

    clock.advance(Duration::from_millis(1500));
    let third = endpoint.fetch(&1, ExecutionOptions::new()).await.unwrap();
    assert_eq!(third, first);
    assert_eq!(transport.call_count(), 2, "Expired entry must be refetched");
    assert!(!endpoint.state().meta.from_cache);
}

#[tokio::test]
async fn test_different_params_use_different_entries() {
    let transport = MockTransport::new().respond_with(user_envelope());
    let client = client_with_clock(&transport, &ManualClock::new());
    let endpoint = client.create_endpoint::<u64, Value>("getUser", get_user().with_cache(CachePolicy::ttl(Duration::from_secs(60))));

    endpoint.fetch(&1, ExecutionOptions::new()).await.unwrap();
    endpoint.fetch(&2, ExecutionOptions::new()).await.unwrap();
    endpoint.fetch(&1, ExecutionOptions::new()).await.unwrap();

    assert_eq!(transport.call_count(), 2);
}

#[tokio::test]
async fn test_cacheable_headers_split_entries() {
    let transport = MockTransport::new().respond_with(user_envelope());
    let client = client_with_clock(&transport, &ManualClock::new());
    client.set_cacheable_header_keys(["x-tenant"]);
    let endpoint = client.create_endpoint::<u64, Value>("getUser", get_user().with_cache(CachePolicy::ttl(Duration::from_secs(60))));

    let tenant = |name: &str| ExecutionOptions::new().with_header("X-Tenant", name);
    endpoint.fetch(&1, tenant("acme")).await.unwrap();
    endpoint.fetch(&1, tenant("globex")).await.unwrap();
    endpoint.fetch(&1, tenant("acme")).await.unwrap();
    // Not allow-listed, so it does not split the key
    endpoint
        .fetch(&1, tenant("acme").with_header("x-request-id", "r1"))
        .await
        .unwrap();

    assert_eq!(transport.call_count(), 2);
}

#[tokio::test]
async fn test_disable_cache_per_call_always_reaches_transport() {
    let transport = MockTransport::new().respond_with(user_envelope());
    let client = client_with_clock(&transport, &ManualClock::new());
    let endpoint = client.create_endpoint::<u64, Value>("getUser", get_user().with_cache(CachePolicy::ttl(Duration::from_secs(60))));

    endpoint.fetch(&1, ExecutionOptions::new()).await.unwrap();
    endpoint.fetch(&1, ExecutionOptions::new().disable_cache()).await.unwrap();

    assert_eq!(transport.call_count(), 2);
}

#[tokio::test]
async fn test_mutation_invalidates_tagged_entries() {
    let transport = MockTransport::new().respond_with(user_envelope());
    let client = client_with_clock(&transport, &ManualClock::new());
    let events = Recorder::<Event>::new();
    let _subscription = client.subscribe_event(EventKind::CacheInvalidate, events.listener());

    let ttl = || CachePolicy::ttl(Duration::from_secs(60));
    let users = client.create_endpoint::<u64, Value>("getUser", get_user().with_cache(ttl()).with_tags(["users"]));
    let posts = client.create_endpoint::<u64, Value>(
        "getPost",
        EndpointConfig::new(|id: &u64| RequestDescription::get(format!("/posts/{id}")))
            .with_cache(ttl())
            .with_tags(["posts"]),
    );
    let update = client.create_endpoint::<u64, Value>(
        "updateUser",
        EndpointConfig::new(|id: &u64| RequestDescription::post(format!("/users/{id}"), json!({ "name": "Grace" })))
            .with_invalidates_tags(["users"]),
    );

    users.fetch(&1, ExecutionOptions::new()).await.unwrap();
    posts.fetch(&1, ExecutionOptions::new()).await.unwrap();
    assert_eq!(transport.call_count(), 2);

    update.fetch(&1, ExecutionOptions::new()).await.unwrap();
    assert_eq!(transport.call_count(), 3);
    assert_eq!(events.len(), 1);
    assert_eq!(events.values()[0].payload, json!({ "removed": 1 }));

    users.fetch(&1, ExecutionOptions::new()).await.unwrap();
    posts.fetch(&1, ExecutionOptions::new()).await.unwrap();
    assert_eq!(transport.call_count(), 4, "Only the users entry was invalidated");
}

#[tokio::test]
async fn test_client_invalidate_tags_and_endpoint_invalidate() {
    let transport = MockTransport::new().respond_with(user_envelope());
    let client = client_with_clock(&transport, &ManualClock::new());
    let endpoint = client.create_endpoint::<u64, Value>(
        "getUser",
        get_user().with_cache(CachePolicy::ttl(Duration::from_secs(60))).with_tags(["users"]),
    );

    endpoint.fetch(&1, ExecutionOptions::new()).await.unwrap();
    endpoint.fetch(&2, ExecutionOptions::new()).await.unwrap();
    assert_eq!(client.invalidate_tags(&["users".to_string()]).await, 2);
    assert_eq!(client.invalidate_tags(&["users".to_string()]).await, 0);

    endpoint.fetch(&1, ExecutionOptions::new()).await.unwrap();
    assert_eq!(endpoint.invalidate().await, 1);
    assert_eq!(endpoint.state().status, EndpointStatus::Idle);
}

// ============================================================================
// Middleware
// ============================================================================

#[tokio::test]
async fn test_request_middleware_runs_by_priority_and_survives_failures() {
    let transport = MockTransport::new().respond_with(user_envelope());
    let client = client_with_clock(&transport, &ManualClock::new());
    let order = Arc::new(Mutex::new(Vec::new()));

    for priority in [1, 10, 5] {
        let order = Arc::clone(&order);
        client.use_middleware(Arc::new(
            FnMiddleware::new(MiddlewareOptions::new(format!("mw-{priority}"), priority)).on_request(
                move |request, options, _ctx| {
                    order.lock().unwrap().push(priority);
                    Ok((request.with_header(format!("x-mw-{priority}"), "1"), options))
                },
            ),
        ));
    }
    client.use_middleware(Arc::new(
        FnMiddleware::new(MiddlewareOptions::new("broken", 7)).on_request(|request, _options, _ctx| {
            let _poisoned = request.with_header("x-broken", "1");
            Err(MiddlewareError::Failed("boom".into()))
        }),
    ));

    let endpoint = client.create_endpoint::<u64, User>("getUser", get_user());
    endpoint.fetch(&1, ExecutionOptions::new()).await.unwrap();

    assert_eq!(*order.lock().unwrap(), vec![10, 5, 1]);
    let sent = transport.last_request().unwrap();
    assert_eq!(sent.header("x-mw-10"), Some("1"));
    assert_eq!(sent.header("x-mw-5"), Some("1"));
    assert_eq!(sent.header("x-mw-1"), Some("1"));
    assert_eq!(sent.header("x-broken"), None);
}

#[tokio::test]
async fn test_middleware_scoped_to_other_endpoint_is_skipped() {
    let transport = MockTransport::new().respond_with(user_envelope());
    let client = client_with_clock(&transport, &ManualClock::new());
    client.use_middleware(Arc::new(
        FnMiddleware::new(MiddlewareOptions::new("posts-only", 0).for_endpoints(["getPost"]))
            .on_request(|request, options, _ctx| Ok((request.with_header("x-posts", "1"), options))),
    ));

    let endpoint = client.create_endpoint::<u64, Value>("getUser", get_user());
    endpoint.fetch(&1, ExecutionOptions::new()).await.unwrap();

    assert_eq!(transport.last_request().unwrap().header("x-posts"), None);
}

#[tokio::test]
async fn test_response_middleware_runs_on_cache_hits() {
    let transport = MockTransport::new().respond_with(user_envelope());
    let client = client_with_clock(&transport, &ManualClock::new());
    client.use_middleware(Arc::new(
        FnMiddleware::new(MiddlewareOptions::new("wrap", 0)).on_response(|envelope, _ctx| {
            let data = envelope.data.clone().unwrap_or(Value::Null);
            Ok(ResultEnvelope {
                data: Some(json!({ "wrapped": data })),
                ..envelope
            })
        }),
    ));
    let endpoint = client.create_endpoint::<u64, Value>("getUser", get_user().with_cache(CachePolicy::ttl(Duration::from_secs(60))));

    let fresh = endpoint.fetch(&1, ExecutionOptions::new()).await.unwrap();
    let cached = endpoint.fetch(&1, ExecutionOptions::new()).await.unwrap();

    assert_eq!(fresh, json!({ "wrapped": { "id": 1, "name": "Ada" } }));
    assert_eq!(cached, fresh, "Cached raw envelope is transformed exactly once");
    assert_eq!(transport.call_count(), 1);
}

#[tokio::test]
async fn test_error_middleware_recovers_call() {
    let transport = MockTransport::new().respond_with(ResultEnvelope::failure(ApiError::new(500, "down")));
    let client = client_with_clock(&transport, &ManualClock::new());
    let events = Recorder::<Event>::new();
    let _subscription = client.subscribe_endpoint("getUser", events.listener());
    client.use_middleware(Arc::new(
        FnMiddleware::new(MiddlewareOptions::new("fallback", 0)).on_error(|_error, _ctx| {
            Box::pin(async {
                Ok(ErrorOutcome::Recovered(ResultEnvelope::success(
                    200,
                    json!({ "id": 0, "name": "fallback" }),
                )))
            })
        }),
    ));

    let endpoint = client.create_endpoint::<u64, User>("getUser", get_user());
    let user = endpoint.fetch(&1, ExecutionOptions::new()).await.unwrap();

    assert_eq!(user.name, "fallback");
    let recorded = events.values();
    assert_eq!(kinds(&recorded), vec![EventKind::RequestStart, EventKind::RequestSuccess]);
    assert!(recorded[1].context.as_ref().unwrap().recovered_from_error);
    let state = endpoint.state();
    assert_eq!(state.status, EndpointStatus::Success);
    assert!(state.meta.recovered);
}

#[tokio::test]
async fn test_error_middleware_can_transform_error() {
    let transport = MockTransport::new().respond_with(ResultEnvelope::failure(ApiError::new(500, "down")));
    let client = client_with_clock(&transport, &ManualClock::new());
    client.use_middleware(Arc::new(
        FnMiddleware::new(MiddlewareOptions::new("relabel", 0)).on_error(|error, _ctx| {
            Box::pin(async move { Ok(ErrorOutcome::Continue(error.with_code("UPSTREAM"))) })
        }),
    ));

    let endpoint = client.create_endpoint::<u64, User>("getUser", get_user());
    let error = endpoint.fetch(&1, ExecutionOptions::new()).await.unwrap_err();

    let api_error = error.api_error().unwrap();
    assert_eq!(api_error.status, 500);
    assert_eq!(api_error.code.as_deref(), Some("UPSTREAM"));
    assert_eq!(endpoint.state().error.unwrap().code.as_deref(), Some("UPSTREAM"));
}

#[tokio::test(start_paused = true)]
async fn test_retry_middleware_recovers_transient_failure() {
    let transport = MockTransport::new().respond_with(user_envelope());
    transport.push_response(ResultEnvelope::failure(ApiError::new(503, "busy")));
    transport.push_response(ResultEnvelope::failure(ApiError::new(503, "busy")));
    let client = client_with_clock(&transport, &ManualClock::new());
    client.use_middleware(Arc::new(RetryMiddleware::new(
        RetryPolicy::builder()
            .max_retries(3)
            .initial_delay(Duration::from_millis(10))
            .build(),
    )));

    let endpoint = client.create_endpoint::<u64, User>("getUser", get_user());
    let user = endpoint.fetch(&1, ExecutionOptions::new()).await.unwrap();

    assert_eq!(user.id, 1);
    assert_eq!(transport.call_count(), 3);
    assert!(endpoint.state().meta.recovered);
}

#[tokio::test(start_paused = true)]
async fn test_retry_middleware_ignores_client_errors() {
    let transport = MockTransport::new().respond_with(ResultEnvelope::failure(ApiError::new(404, "missing")));
    let client = client_with_clock(&transport, &ManualClock::new());
    client.use_middleware(Arc::new(RetryMiddleware::new(RetryPolicy::default())));

    let endpoint = client.create_endpoint::<u64, User>("getUser", get_user());
    let error = endpoint.fetch(&1, ExecutionOptions::new()).await.unwrap_err();

    assert_eq!(error.api_error().unwrap().status, 404);
    assert_eq!(transport.call_count(), 1);
}

// ============================================================================
// State and events
// ============================================================================

#[tokio::test]
async fn test_state_sequence_idle_loading_success_error() {
    let transport = MockTransport::new().respond_with(ResultEnvelope::failure(ApiError::new(500, "down")));
    transport.push_response(user_envelope());
    let client = client_with_clock(&transport, &ManualClock::new());
    let endpoint = client.create_endpoint::<u64, User>("getUser", get_user());
    let states = Recorder::<EndpointState<User>>::new();
    let _subscription = endpoint.subscribe(states.listener());

    endpoint.fetch(&1, ExecutionOptions::new()).await.unwrap();
    endpoint.fetch(&1, ExecutionOptions::new()).await.unwrap_err();

    let statuses: Vec<EndpointStatus> = states.values().iter().map(|state| state.status).collect();
    assert_eq!(
        statuses,
        vec![
            EndpointStatus::Idle,
            EndpointStatus::Loading,
            EndpointStatus::Success,
            EndpointStatus::Loading,
            EndpointStatus::Error,
        ]
    );
    let last = states.values().pop().unwrap();
    assert_eq!(last.error.unwrap().status, 500);
    assert_eq!(last.data.map(|user| user.name), Some("Ada".to_string()), "Error keeps previous data");
}

#[tokio::test]
async fn test_builder_failure_is_reported_without_start_event() {
    let transport = MockTransport::new().respond_with(user_envelope());
    let client = client_with_clock(&transport, &ManualClock::new());
    let events = Recorder::<Event>::new();
    let _subscription = client.subscribe_all(events.listener());
    let endpoint = client.create_endpoint::<u64, Value>(
        "getUser",
        EndpointConfig::try_new(|id: &u64| {
            if *id == 0 {
                Err("id must be positive".to_string())
            } else {
                Ok(RequestDescription::get(format!("/users/{id}")))
            }
        }),
    );

    let error = endpoint.fetch(&0, ExecutionOptions::new()).await.unwrap_err();

    assert!(matches!(error, RequestError::BuildRequest { .. }));
    assert_eq!(transport.call_count(), 0);
    let recorded = events.values();
    assert_eq!(kinds(&recorded), vec![EventKind::RequestError]);
    assert!(recorded[0].context.as_ref().unwrap().uncaught_error);
}

#[tokio::test]
async fn test_tag_listeners_receive_tagged_events() {
    let transport = MockTransport::new().respond_with(user_envelope());
    let client = client_with_clock(&transport, &ManualClock::new());
    let users = Recorder::<Event>::new();
    let _subscription = client.subscribe_tag("users", users.listener());

    let tagged = client.create_endpoint::<u64, Value>("getUser", get_user().with_tags(["users"]));
    let untagged = client.create_endpoint::<u64, Value>(
        "getPost",
        EndpointConfig::new(|id: &u64| RequestDescription::get(format!("/posts/{id}"))),
    );
    tagged.fetch(&1, ExecutionOptions::new()).await.unwrap();
    untagged.fetch(&1, ExecutionOptions::new()).await.unwrap();

    assert_eq!(kinds(&users.values()), vec![EventKind::RequestStart, EventKind::RequestSuccess]);
    assert!(
        users
            .values()
            .iter()
            .all(|event| event.endpoint_name.as_deref() == Some("getUser"))
    );
}

#[tokio::test]
async fn test_invalidate_on_error_clears_endpoint_tags() {
    let transport = MockTransport::new().respond_with(user_envelope());
    let config = ClientConfig::from_toml_str(
        r#"
        [cache]
        ttl_ms = 60000
        invalidate_on_error = true
        "#,
    )
    .unwrap();
    let client = Client::builder(config, transport.clone())
        .with_clock(Arc::new(ManualClock::new()))
        .build();
    let endpoint = client.create_endpoint::<u64, Value>("getUser", get_user().with_tags(["users"]));

    endpoint.fetch(&1, ExecutionOptions::new()).await.unwrap();
    transport.push_response(ResultEnvelope::failure(ApiError::new(500, "down")));
    endpoint.fetch(&2, ExecutionOptions::new()).await.unwrap_err();

    endpoint.fetch(&1, ExecutionOptions::new()).await.unwrap();
    assert_eq!(transport.call_count(), 3, "Error on /users/2 invalidated the /users/1 entry");
    client.destroy();
}

// ============================================================================
// Configuration and storage
// ============================================================================

#[tokio::test]
async fn test_toml_rules_select_cached_endpoints() {
    let transport = MockTransport::new().respond_with(user_envelope());
    let config = ClientConfig::from_toml_str(
        r#"
        storage_type = "memory"
        cacheable_header_keys = ["x-tenant"]

        [cache]
        invalidate_on_error = false

        [[cache.rules]]
        method = "get*"
        ttl_ms = 5000
        tags = ["reads"]
        "#,
    )
    .unwrap();
    let clock = ManualClock::new();
    let client = Client::builder(config, transport.clone())
        .with_clock(Arc::new(clock.clone()))
        .build();

    let get = client.create_endpoint::<u64, Value>("getUser", get_user());
    let list = client.create_endpoint::<(), Value>("listUsers", EndpointConfig::new(|(): &()| RequestDescription::get("/users")));

    get.fetch(&1, ExecutionOptions::new()).await.unwrap();
    get.fetch(&1, ExecutionOptions::new()).await.unwrap();
    list.fetch(&(), ExecutionOptions::new()).await.unwrap();
    list.fetch(&(), ExecutionOptions::new()).await.unwrap();
    assert_eq!(transport.call_count(), 3);

    // Rule tags are stamped on the entry
    assert_eq!(client.invalidate_tags(&["reads".to_string()]).await, 1);

    get.fetch(&1, ExecutionOptions::new()).await.unwrap();
    clock.advance(Duration::from_millis(6000));
    get.fetch(&1, ExecutionOptions::new()).await.unwrap();
    assert_eq!(transport.call_count(), 5);
}

#[tokio::test]
async fn test_failing_store_falls_back_to_uncached_memory_state() {
    let transport = MockTransport::new().respond_with(user_envelope());
    let config = ClientConfig::default().with_storage(StorageType::Persistent);
    let client = Client::builder(config, transport.clone())
        .with_store(Arc::new(FailingStore::new()))
        .build_checked()
        .await;
    assert!(!client.caching_enabled());

    let endpoint = client.create_endpoint::<u64, User>("getUser", get_user().with_cache(CachePolicy::ttl(Duration::from_secs(60))));
    endpoint.fetch(&1, ExecutionOptions::new()).await.unwrap();
    endpoint.fetch(&1, ExecutionOptions::new()).await.unwrap();

    assert_eq!(transport.call_count(), 2);
    assert_eq!(endpoint.state().status, EndpointStatus::Success);
}

#[tokio::test]
async fn test_states_restore_from_shared_store() {
    let store = Arc::new(apiflow_runtime::MemoryStore::new());
    let transport = MockTransport::new().respond_with(user_envelope());
    let config = ClientConfig::default().with_storage(StorageType::Persistent);

    let first = Client::builder(config.clone(), transport.clone())
        .with_store(store.clone())
        .build_checked()
        .await;
    let endpoint = first.create_endpoint::<u64, User>("getUser", get_user());
    endpoint.fetch(&1, ExecutionOptions::new()).await.unwrap();

    let second = Client::builder(config, transport).with_store(store).build_checked().await;
    let restored = second.create_endpoint::<u64, User>("getUser", get_user());
    assert_eq!(restored.state().status, EndpointStatus::Idle);
    assert_eq!(second.restore_states().await, 1);
    assert_eq!(restored.state().status, EndpointStatus::Success);
    assert_eq!(restored.state().data.map(|user| user.id), Some(1));
}

#[tokio::test]
async fn test_request_by_name_matches_typed_fetch() {
    let transport = MockTransport::new().respond_with(user_envelope());
    let client = client_with_clock(&transport, &ManualClock::new());
    let _endpoint = client.create_endpoint::<u64, User>("getUser", get_user());

    let data = client.request("getUser", json!(1), ExecutionOptions::new()).await.unwrap();
    assert_eq!(data, json!({ "id": 1, "name": "Ada" }));

    let error = client.request("getPost", json!(1), ExecutionOptions::new()).await.unwrap_err();
    assert_eq!(error, RequestError::UnknownEndpoint("getPost".to_string()));
}
