//! Subscription lifecycle and notification delivery, observed through
//! the recording sender.

mod common;

use common::*;
use cse_server::error::ResponseStatusCode;
use cse_server::request::Operation;
use cse_server::ResourceType;
use serde_json::{Value, json};

const LISTENER: &str = "http://listener.example/notify";

async fn seed_container(h: &TestCse) -> String {
    let (_, acp) = send_ok(
        &h.cse,
        create_request(
            "cse-in",
            "admin",
            ResourceType::Acp,
            json!({"m2m:acp": {
                "rn": "acp",
                "pv":  {"acr": [{"acor": ["admin"], "acop": 63}]},
                "pvs": {"acr": [{"acor": ["admin"], "acop": 63}]},
            }}),
        ),
    )
    .await;
    let acp_ri = ri_of(&acp.unwrap());
    let (_, cnt) = send_ok(
        &h.cse,
        create_request(
            "cse-in",
            "admin",
            ResourceType::Cnt,
            json!({"m2m:cnt": {"rn": "cnt", "acpi": [acp_ri]}}),
        ),
    )
    .await;
    ri_of(&cnt.unwrap())
}

fn is_verification(body: &Value) -> bool {
    body["m2m:sgn"]["vrq"] == json!(true)
}

fn event_notifications(bodies: &[Value]) -> Vec<&Value> {
    bodies
        .iter()
        .filter(|body| body.get("m2m:sgn").is_some() && !is_verification(body))
        .filter(|body| body["m2m:sgn"]["sud"] != json!(true))
        .collect()
}

#[tokio::test]
async fn subscription_create_sends_verification() {
    let mut h = test_cse().await;
    seed_container(&h).await;
    let (rsc, pc) = send_ok(
        &h.cse,
        create_request(
            "cse-in/cnt",
            "admin",
            ResourceType::Sub,
            json!({"m2m:sub": {"rn": "sub", "nu": [LISTENER], "enc": {"net": [3]}}}),
        ),
    )
    .await;
    assert_eq!(rsc, ResponseStatusCode::Created);
    let sub_ri = ri_of(&pc.unwrap());
    h.worker.drain().await;

    let bodies = h.sender.notifications().await;
    let verifications: Vec<&Value> = bodies.iter().filter(|b| is_verification(b)).collect();
    assert_eq!(verifications.len(), 1);
    assert_eq!(
        verifications[0]["m2m:sgn"]["sur"],
        json!(format!("/id-in/{sub_ri}"))
    );
    assert_eq!(verifications[0]["m2m:sgn"]["cr"], json!("admin"));
    // nothing but the verification went out
    assert_eq!(event_notifications(&bodies).len(), 0);
}

#[tokio::test]
async fn unreachable_target_fails_the_subscription_create() {
    let h = test_cse().await;
    seed_container(&h).await;
    h.sender.fail_target("http://unreachable.example").await;

    let err = send_err(
        &h.cse,
        create_request(
            "cse-in/cnt",
            "admin",
            ResourceType::Sub,
            json!({"m2m:sub": {"rn": "sub", "nu": ["http://unreachable.example/n"],
                                "enc": {"net": [3]}}}),
        ),
    )
    .await;
    assert_eq!(
        err.rsc,
        ResponseStatusCode::SubscriptionVerificationInitiationFailed
    );
    // no partial state
    let err = send_err(&h.cse, request(Operation::Retrieve, "cse-in/cnt/sub", "admin")).await;
    assert_eq!(err.rsc, ResponseStatusCode::NotFound);
}

#[tokio::test]
async fn child_create_event_notifies_subscriber() {
    let mut h = test_cse().await;
    seed_container(&h).await;
    send_ok(
        &h.cse,
        create_request(
            "cse-in/cnt",
            "admin",
            ResourceType::Sub,
            json!({"m2m:sub": {"rn": "sub", "nu": [LISTENER], "enc": {"net": [3]}}}),
        ),
    )
    .await;
    h.worker.drain().await;

    send_ok(
        &h.cse,
        create_request(
            "cse-in/cnt",
            "admin",
            ResourceType::Cin,
            json!({"m2m:cin": {"rn": "cin1", "con": "payload"}}),
        ),
    )
    .await;
    h.worker.drain().await;

    let bodies = h.sender.notifications().await;
    let events = event_notifications(&bodies);
    assert_eq!(events.len(), 1);
    let sgn = &events[0]["m2m:sgn"];
    assert_eq!(sgn["nev"]["net"], json!(3));
    assert_eq!(sgn["nev"]["rep"]["m2m:cin"]["con"], json!("payload"));
}

#[tokio::test]
async fn child_type_filter_applies() {
    let mut h = test_cse().await;
    seed_container(&h).await;
    // only interested in container children (ty 3)
    send_ok(
        &h.cse,
        create_request(
            "cse-in/cnt",
            "admin",
            ResourceType::Sub,
            json!({"m2m:sub": {"rn": "sub", "nu": [LISTENER],
                                "enc": {"net": [3], "chty": [3]}}}),
        ),
    )
    .await;
    send_ok(
        &h.cse,
        create_request(
            "cse-in/cnt",
            "admin",
            ResourceType::Cin,
            json!({"m2m:cin": {"con": "ignored"}}),
        ),
    )
    .await;
    h.worker.drain().await;
    assert_eq!(
        event_notifications(&h.sender.notifications().await).len(),
        0
    );

    send_ok(
        &h.cse,
        create_request(
            "cse-in/cnt",
            "admin",
            ResourceType::Cnt,
            json!({"m2m:cnt": {"rn": "inner"}}),
        ),
    )
    .await;
    h.worker.drain().await;
    assert_eq!(
        event_notifications(&h.sender.notifications().await).len(),
        1
    );
}

#[tokio::test]
async fn update_notifications_respect_the_attribute_filter() {
    let mut h = test_cse().await;
    seed_container(&h).await;
    send_ok(
        &h.cse,
        create_request(
            "cse-in/cnt",
            "admin",
            ResourceType::Sub,
            json!({"m2m:sub": {"rn": "sub", "nu": [LISTENER],
                                "enc": {"net": [1], "atr": ["lbl"]}}}),
        ),
    )
    .await;
    h.worker.drain().await;

    // unrelated attribute: filtered out
    send_ok(
        &h.cse,
        update_request("cse-in/cnt", "admin", json!({"m2m:cnt": {"mni": 10}})),
    )
    .await;
    h.worker.drain().await;
    assert_eq!(
        event_notifications(&h.sender.notifications().await).len(),
        0
    );

    send_ok(
        &h.cse,
        update_request("cse-in/cnt", "admin", json!({"m2m:cnt": {"lbl": ["new"]}})),
    )
    .await;
    h.worker.drain().await;
    assert_eq!(
        event_notifications(&h.sender.notifications().await).len(),
        1
    );

    // identical update changes nothing and fires nothing
    send_ok(
        &h.cse,
        update_request("cse-in/cnt", "admin", json!({"m2m:cnt": {"lbl": ["new"]}})),
    )
    .await;
    h.worker.drain().await;
    assert_eq!(
        event_notifications(&h.sender.notifications().await).len(),
        1
    );
}

#[tokio::test]
async fn batched_notifications_aggregate_at_the_configured_size() {
    let mut h = test_cse().await;
    seed_container(&h).await;
    send_ok(
        &h.cse,
        create_request(
            "cse-in/cnt",
            "admin",
            ResourceType::Sub,
            json!({"m2m:sub": {"rn": "sub", "nu": [LISTENER],
                                "enc": {"net": [3]}, "bn": {"num": 3}}}),
        ),
    )
    .await;
    h.worker.drain().await;

    for n in 1..=3 {
        send_ok(
            &h.cse,
            create_request(
                "cse-in/cnt",
                "admin",
                ResourceType::Cin,
                json!({"m2m:cin": {"con": format!("v{n}")}}),
            ),
        )
        .await;
        h.worker.drain().await;
    }

    let bodies = h.sender.notifications().await;
    let aggregated: Vec<&Value> = bodies
        .iter()
        .filter(|body| body.get("m2m:agn").is_some())
        .collect();
    assert_eq!(aggregated.len(), 1);
    let batch = aggregated[0]["m2m:agn"]["m2m:sgn"].as_array().unwrap();
    assert_eq!(batch.len(), 3);
    // enqueue order is preserved
    assert_eq!(batch[0]["nev"]["rep"]["m2m:cin"]["con"], json!("v1"));
    assert_eq!(batch[2]["nev"]["rep"]["m2m:cin"]["con"], json!("v3"));
    // nothing was sent unbatched
    assert_eq!(event_notifications(&bodies).len(), 0);
}

#[tokio::test]
async fn latest_notify_collapses_the_batch_and_sets_the_event_category() {
    let mut h = test_cse().await;
    seed_container(&h).await;
    send_ok(
        &h.cse,
        create_request(
            "cse-in/cnt",
            "admin",
            ResourceType::Sub,
            json!({"m2m:sub": {"rn": "sub", "nu": [LISTENER],
                                "enc": {"net": [3]}, "bn": {"num": 2}, "ln": true}}),
        ),
    )
    .await;
    h.worker.drain().await;

    for n in 1..=2 {
        send_ok(
            &h.cse,
            create_request(
                "cse-in/cnt",
                "admin",
                ResourceType::Cin,
                json!({"m2m:cin": {"con": format!("v{n}")}}),
            ),
        )
        .await;
        h.worker.drain().await;
    }

    let aggregated: Vec<_> = h
        .sender
        .requests_of(Operation::Notify)
        .await
        .into_iter()
        .filter(|request| {
            request
                .body
                .as_ref()
                .is_some_and(|body| body.get("m2m:agn").is_some())
        })
        .collect();
    assert_eq!(aggregated.len(), 1);
    // only the newest enqueued notification goes out
    let batch = aggregated[0].body.as_ref().unwrap()["m2m:agn"]["m2m:sgn"]
        .as_array()
        .unwrap()
        .clone();
    assert_eq!(batch.len(), 1);
    assert_eq!(batch[0]["nev"]["rep"]["m2m:cin"]["con"], json!("v2"));
    // the latest event-category travels on the wire as "4"
    assert_eq!(aggregated[0].ec.as_deref(), Some("4"));
}

#[tokio::test]
async fn deleting_a_subscription_flushes_batches_and_sends_the_notice() {
    let mut h = test_cse().await;
    seed_container(&h).await;
    send_ok(
        &h.cse,
        create_request(
            "cse-in/cnt",
            "admin",
            ResourceType::Sub,
            json!({"m2m:sub": {"rn": "sub", "nu": [LISTENER],
                                "enc": {"net": [3]}, "bn": {"num": 10}}}),
        ),
    )
    .await;
    h.worker.drain().await;

    for _ in 0..2 {
        send_ok(
            &h.cse,
            create_request(
                "cse-in/cnt",
                "admin",
                ResourceType::Cin,
                json!({"m2m:cin": {"con": "x"}}),
            ),
        )
        .await;
        h.worker.drain().await;
    }

    let (rsc, _) = send_ok(&h.cse, request(Operation::Delete, "cse-in/cnt/sub", "admin")).await;
    assert_eq!(rsc, ResponseStatusCode::Deleted);
    h.worker.drain().await;

    let bodies = h.sender.notifications().await;
    let aggregated: Vec<&Value> = bodies
        .iter()
        .filter(|body| body.get("m2m:agn").is_some())
        .collect();
    assert_eq!(aggregated.len(), 1);
    assert_eq!(aggregated[0]["m2m:agn"]["m2m:sgn"].as_array().unwrap().len(), 2);

    let notices: Vec<&Value> = bodies
        .iter()
        .filter(|body| body["m2m:sgn"]["sud"] == json!(true))
        .collect();
    assert_eq!(notices.len(), 1);
}

#[tokio::test]
async fn expiration_counter_removes_the_subscription() {
    let mut h = test_cse().await;
    seed_container(&h).await;
    send_ok(
        &h.cse,
        create_request(
            "cse-in/cnt",
            "admin",
            ResourceType::Sub,
            json!({"m2m:sub": {"rn": "sub", "nu": [LISTENER],
                                "enc": {"net": [3]}, "exc": 2}}),
        ),
    )
    .await;
    h.worker.drain().await;

    for n in 1..=3 {
        send_ok(
            &h.cse,
            create_request(
                "cse-in/cnt",
                "admin",
                ResourceType::Cin,
                json!({"m2m:cin": {"con": format!("v{n}")}}),
            ),
        )
        .await;
        h.worker.drain().await;
    }

    // exactly two deliveries happened, then the subscription vanished
    let bodies = h.sender.notifications().await;
    assert_eq!(event_notifications(&bodies).len(), 2);
    let err = send_err(&h.cse, request(Operation::Retrieve, "cse-in/cnt/sub", "admin")).await;
    assert_eq!(err.rsc, ResponseStatusCode::NotFound);
}

#[tokio::test]
async fn updated_subscription_verifies_only_new_targets() {
    let mut h = test_cse().await;
    seed_container(&h).await;
    send_ok(
        &h.cse,
        create_request(
            "cse-in/cnt",
            "admin",
            ResourceType::Sub,
            json!({"m2m:sub": {"rn": "sub", "nu": [LISTENER], "enc": {"net": [3]}}}),
        ),
    )
    .await;
    h.worker.drain().await;

    let second = "http://second.example/notify";
    send_ok(
        &h.cse,
        update_request(
            "cse-in/cnt/sub",
            "admin",
            json!({"m2m:sub": {"nu": [LISTENER, second]}}),
        ),
    )
    .await;
    h.worker.drain().await;

    let bodies = h.sender.notifications().await;
    let verification_targets: Vec<String> = h
        .sender
        .sent
        .lock()
        .await
        .iter()
        .filter(|request| {
            request
                .body
                .as_ref()
                .is_some_and(|body| body["m2m:sgn"]["vrq"] == json!(true))
        })
        .map(|request| request.uri.clone())
        .collect();
    assert_eq!(verification_targets.len(), 2);
    assert_eq!(
        verification_targets
            .iter()
            .filter(|uri| uri.as_str() == LISTENER)
            .count(),
        1
    );
    assert_eq!(
        verification_targets
            .iter()
            .filter(|uri| uri.as_str() == second)
            .count(),
        1
    );
    let _ = bodies;
}
