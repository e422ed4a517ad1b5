//! Announcement mirroring to the registrar CSE, observed through the
//! recording sender.

mod common;

use common::*;
use cse_server::error::ResponseStatusCode;
use cse_server::request::Operation;
use cse_server::ResourceType;
use serde_json::{Value, json};

async fn create_announced_ae(h: &TestCse) -> String {
    let (rsc, pc) = send_ok(
        &h.cse,
        create_request(
            "cse-in",
            "admin",
            ResourceType::Ae,
            json!({"m2m:ae": {"rn": "annAe", "api": "Napp", "rr": false,
                               "lbl": ["aLabel"], "at": ["/id-mn"], "aa": ["lbl"]}}),
        ),
    )
    .await;
    assert_eq!(rsc, ResponseStatusCode::Created);
    ri_of(&pc.unwrap())
}

#[tokio::test]
async fn announced_resource_is_mirrored_with_a_link() {
    let mut h = test_cse().await;
    let ae_ri = create_announced_ae(&h).await;
    h.worker.drain().await;

    let creates = h.sender.requests_of(Operation::Create).await;
    assert_eq!(creates.len(), 1);
    let create = &creates[0];
    assert_eq!(create.ty, Some(ResourceType::AeAnnc));
    assert!(create.uri.starts_with("http://remote.example:8080/~/id-mn"));

    let body = create.body.as_ref().unwrap();
    let annc = &body["m2m:aeA"];
    assert_eq!(annc["lnk"], json!(format!("/id-in/{ae_ri}")));
    assert_eq!(annc["rn"], json!("annAe_Annc"));
    // optional announced attribute requested via aa
    assert_eq!(annc["lbl"], json!(["aLabel"]));
    // mandatory announced attribute travels without being requested
    assert!(annc["et"].is_string());

    // the local at entry now points at the mirror
    let (_, pc) = send_ok(&h.cse, request(Operation::Retrieve, "cse-in/annAe", "admin")).await;
    let at = pc.unwrap()["m2m:ae"]["at"].clone();
    assert_eq!(at, json!(["/id-mn/annc0"]));
}

#[tokio::test]
async fn non_announceable_attributes_are_stripped_from_aa() {
    let h = test_cse().await;
    let (rsc, pc) = send_ok(
        &h.cse,
        create_request(
            "cse-in",
            "admin",
            ResourceType::Ae,
            json!({"m2m:ae": {"rn": "nullAa", "api": "Napp", "rr": false,
                               "at": ["/id-mn"],
                               "aa": ["rn", "ri", "pi", "ct", "lt"]}}),
        ),
    )
    .await;
    assert_eq!(rsc, ResponseStatusCode::Created);
    let ae = pc.unwrap();
    // the key stays, the value is null
    assert!(ae["m2m:ae"].as_object().unwrap().contains_key("aa"));
    assert!(ae["m2m:ae"]["aa"].is_null());
}

#[tokio::test]
async fn removing_the_target_deletes_the_mirror() {
    let mut h = test_cse().await;
    create_announced_ae(&h).await;
    h.worker.drain().await;
    assert_eq!(h.sender.requests_of(Operation::Create).await.len(), 1);

    let (rsc, _) = send_ok(
        &h.cse,
        update_request("cse-in/annAe", "admin", json!({"m2m:ae": {"at": null}})),
    )
    .await;
    assert_eq!(rsc, ResponseStatusCode::Updated);
    h.worker.drain().await;

    let deletes = h.sender.requests_of(Operation::Delete).await;
    assert_eq!(deletes.len(), 1);
    assert!(deletes[0].uri.ends_with("/annc0"));

    let (_, pc) = send_ok(&h.cse, request(Operation::Retrieve, "cse-in/annAe", "admin")).await;
    assert!(
        pc.unwrap()["m2m:ae"]
            .as_object()
            .unwrap()
            .get("at")
            .is_none_or(Value::is_null)
    );
}

#[tokio::test]
async fn deleting_the_original_removes_the_mirror() {
    let mut h = test_cse().await;
    create_announced_ae(&h).await;
    h.worker.drain().await;

    let (rsc, _) = send_ok(&h.cse, request(Operation::Delete, "cse-in/annAe", "admin")).await;
    assert_eq!(rsc, ResponseStatusCode::Deleted);
    h.worker.drain().await;

    let deletes = h.sender.requests_of(Operation::Delete).await;
    assert_eq!(deletes.len(), 1);
    assert!(deletes[0].uri.ends_with("/annc0"));
}

#[tokio::test]
async fn aa_updates_reproject_the_mirror() {
    let mut h = test_cse().await;
    create_announced_ae(&h).await;
    h.worker.drain().await;

    let (rsc, _) = send_ok(
        &h.cse,
        update_request(
            "cse-in/annAe",
            "admin",
            json!({"m2m:ae": {"aa": ["lbl", "apn"], "apn": "appName"}}),
        ),
    )
    .await;
    assert_eq!(rsc, ResponseStatusCode::Updated);
    h.worker.drain().await;

    let updates = h.sender.requests_of(Operation::Update).await;
    assert_eq!(updates.len(), 1);
    let body = updates[0].body.as_ref().unwrap();
    assert_eq!(body["m2m:aeA"]["apn"], json!("appName"));
    assert_eq!(body["m2m:aeA"]["lbl"], json!(["aLabel"]));
}
