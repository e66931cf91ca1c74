use ferry_storage::conformance::run_conformance_suite;
use ferry_storage::InMemoryDataFlowStore;

#[tokio::test]
async fn in_memory_store_passes_conformance_suite() {
    let report = run_conformance_suite(|clock, lease| async move {
        InMemoryDataFlowStore::new(clock, lease)
    })
    .await;
    assert!(report.total > 0);
    assert_eq!(report.failed, 0, "{report}");
}
