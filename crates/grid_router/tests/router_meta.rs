//! The meta-index lookup path: descriptor resolution via RangeLookup RPCs,
//! gossip's special role for the first range, and cache eviction on
//! first-range changes.

mod common;

use common::*;
use grid_router::batch::Response;
use grid_router::error::ErrorDetail;
use tokio_util::sync::CancellationToken;

#[tokio::test]
async fn user_keys_resolve_through_the_meta_index() {
    // The first range holds the meta index; user ranges follow.
    let (cluster, store) = TestCluster::with_store_meta_path(vec![
        range_desc(1, b"", b"a", &[1]),
        range_desc(2, b"a", b"m", &[2]),
        range_desc(3, b"m", b"z", &[3]),
    ]);
    store.load(&[(b"b", b"v1"), (b"n", b"v2")]);
    let ds = cluster.sender();
    let ctx = CancellationToken::new();

    let reply = ds
        .send(&ctx, batch_of(vec![get(b"b")]))
        .await
        .expect("send");
    match &reply.responses[0] {
        Response::Get { value, .. } => assert_eq!(value.as_deref(), Some(b"v1".as_slice())),
        other => panic!("expected a get response, got {other:?}"),
    }

    // Two levels of meta lookup preceded the data RPC.
    let summaries: Vec<String> = cluster.client.calls().iter().map(|c| c.summary.clone()).collect();
    assert_eq!(
        summaries,
        vec![
            "[RangeLookup]".to_string(),
            "[RangeLookup]".to_string(),
            "[Get]".to_string(),
        ]
    );

    // A second key in the same range is served from cache.
    ds.send(&ctx, batch_of(vec![get(b"c")])).await.expect("send");
    assert_eq!(cluster.client.call_count(), 4);

    // A key in the next range was prefetched by the first lookup.
    let reply = ds
        .send(&ctx, batch_of(vec![get(b"n")]))
        .await
        .expect("send");
    match &reply.responses[0] {
        Response::Get { value, .. } => assert_eq!(value.as_deref(), Some(b"v2".as_slice())),
        other => panic!("expected a get response, got {other:?}"),
    }
    assert_eq!(cluster.client.call_count(), 5, "no further meta lookups");
}

#[tokio::test]
async fn missing_first_range_descriptor_fails_lookup() {
    // No range starts at the minimum key, so gossip never learns a first
    // range and meta1 lookups cannot be answered.
    let (cluster, _store) =
        TestCluster::with_store_meta_path(vec![range_desc(2, b"a", b"m", &[1])]);
    let ds = cluster.sender();
    let ctx = CancellationToken::new();

    let err = ds
        .send(&ctx, batch_of(vec![get(b"b")]))
        .await
        .expect_err("lookup must fail without a first range");
    assert!(
        err.is_detail(&ErrorDetail::FirstRangeMissing),
        "got {err:?}"
    );
}

#[tokio::test]
async fn gossiped_first_range_change_evicts_cached_descriptor() {
    let first = range_desc(1, b"", b"z", &[1]);
    let (cluster, store) = TestCluster::with_store(vec![first.clone()]);
    store.load(&[(b"b", b"v")]);
    let ds = cluster.sender();
    let ctx = CancellationToken::new();

    ds.send(&ctx, batch_of(vec![get(b"b")])).await.expect("send");
    ds.send(&ctx, batch_of(vec![get(b"b")])).await.expect("send");
    assert_eq!(cluster.db_lookups(), 1, "second send is served from cache");

    // Gossip announces a new incarnation of the first range.
    cluster.gossip.set_first_range_descriptor(&first);
    ds.send(&ctx, batch_of(vec![get(b"b")])).await.expect("send");
    assert_eq!(
        cluster.db_lookups(),
        2,
        "the callback evicted the cached first-range descriptor"
    );
}
