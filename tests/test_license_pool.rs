use gridsched::license::pool::{HresConfig, HresMode, LicensePool, LicenseTest};
use gridsched::state::job::{Job, JobId};
use gridsched::state::node::{Node, NodeTable};
use gridsched::util::bitmap::NodeBitmap;

fn make_nodes(count: usize) -> NodeTable {
    NodeTable::new(
        (0..count)
            .map(|i| Node { name: format!("n{}", i), cpus: 4, sockets: 1, cores_per_socket: 4, available: true })
            .collect(),
    )
}

fn make_job(id: u32) -> Job {
    Job::new(JobId(id), format!("job{}", id), 100, 1000)
}

fn used_of(pool: &LicensePool, name: &str) -> u32 {
    pool.snapshot().iter().find(|l| l.name == name).map(|l| l.used).unwrap_or(u32::MAX)
}

/// Pool matlab:3,comsol:1; request "matlab:2|comsol:2" takes the first
/// satisfying entry and discards the rest of the list.
#[test]
fn test_basic_or_allocation() {
    let nodes = make_nodes(2);
    let pool = LicensePool::new();
    pool.init("matlab:3,comsol:1", &[], false, &nodes, 0).unwrap();

    let mut job = make_job(1);
    job.license_list = pool.validate("matlab:2|comsol:2", true, true, false, None).unwrap();
    assert_eq!(job.license_list.len(), 2);

    assert_eq!(pool.job_test(&mut job, 0, false), LicenseTest::Ok);
    pool.job_get(&mut job, false, 0).unwrap();

    assert_eq!(used_of(&pool, "matlab"), 2);
    assert_eq!(used_of(&pool, "comsol"), 0);
    // After an OR allocation the job holds exactly one license entry.
    assert_eq!(job.license_list.len(), 1);
    assert_eq!(job.licenses_allocated.as_deref(), Some("matlab:2"));
}

#[test]
fn test_used_never_exceeds_total() {
    let nodes = make_nodes(2);
    let pool = LicensePool::new();
    pool.init("lic:2", &[], false, &nodes, 0).unwrap();

    let mut a = make_job(1);
    a.license_list = pool.validate("lic:2", true, true, false, None).unwrap();
    assert_eq!(pool.job_test(&mut a, 0, false), LicenseTest::Ok);
    pool.job_get(&mut a, false, 0).unwrap();

    let mut b = make_job(2);
    b.license_list = pool.validate("lic:1", true, true, false, None).unwrap();
    assert_eq!(pool.job_test(&mut b, 0, false), LicenseTest::Busy);

    for lic in pool.snapshot() {
        assert!(lic.used <= lic.total, "{} used {} > total {}", lic.name, lic.used, lic.total);
    }
}

#[test]
fn test_return_decrements_exactly_and_empty_return_is_noop() {
    let nodes = make_nodes(2);
    let pool = LicensePool::new();
    pool.init("lic:5", &[], false, &nodes, 0).unwrap();

    let mut holder = make_job(1);
    holder.license_list = pool.validate("lic:3", true, true, false, None).unwrap();
    pool.job_get(&mut holder, false, 0).unwrap();
    assert_eq!(used_of(&pool, "lic"), 3);

    let mut empty = make_job(2);
    assert_eq!(pool.job_return(&mut empty), 0);
    assert_eq!(used_of(&pool, "lic"), 3);

    assert!(pool.job_return(&mut holder) > 0);
    assert_eq!(used_of(&pool, "lic"), 0);
}

/// Replaying a saved allocation twice yields the same used count as once.
#[test]
fn test_restore_is_idempotent() {
    let nodes = make_nodes(2);
    let pool = LicensePool::new();
    pool.init("lic:4", &[], false, &nodes, 0).unwrap();

    let mut job = make_job(1);
    job.license_list = pool.validate("lic:2", true, true, false, None).unwrap();
    pool.job_get(&mut job, true, 0).unwrap();
    assert_eq!(used_of(&pool, "lic"), 2);
    pool.job_get(&mut job, true, 0).unwrap();
    assert_eq!(used_of(&pool, "lic"), 2);
}

#[test]
fn test_request_over_configured_total_rejected() {
    let nodes = make_nodes(2);
    let pool = LicensePool::new();
    pool.init("lic:1", &[], false, &nodes, 0).unwrap();

    assert!(pool.validate("lic:2", true, true, false, None).is_err());
    // Unknown names are dropped when existence is not enforced.
    let list = pool.validate("ghost:1", true, false, false, None).unwrap();
    assert!(list.is_empty());
    assert!(pool.validate("ghost:1", true, true, false, None).is_err());
}

/// With reclaim_licenses, an AND request that comes up short records the
/// deficient licenses for the preemption engine; OR requests never do.
#[test]
fn test_reclaim_collects_deficient_licenses() {
    let nodes = make_nodes(2);
    let pool = LicensePool::new();
    pool.init("a:2,b:2", &[], true, &nodes, 0).unwrap();

    let mut holder = make_job(1);
    holder.license_list = pool.validate("a:2", true, true, false, None).unwrap();
    pool.job_get(&mut holder, false, 0).unwrap();

    let mut pending = make_job(2);
    pending.license_list = pool.validate("a:1,b:1", true, true, false, None).unwrap();
    assert_eq!(pool.job_test(&mut pending, 0, true), LicenseTest::Busy);
    assert_eq!(pending.licenses_to_preempt.len(), 1);

    let mut or_pending = make_job(3);
    or_pending.license_list = pool.validate("a:1|b:1", true, true, false, None).unwrap();
    assert_eq!(pool.job_test(&mut or_pending, 0, true), LicenseTest::Ok);
    assert!(or_pending.licenses_to_preempt.is_empty());
}

/// Two Mode1 siblings with hres_id shared: a count=2 request shrinks the
/// placement bitmap to the nodes of the sibling that can satisfy it.
#[test]
fn test_hres_mode1_filters_placement_bitmap() {
    let nodes = make_nodes(4);
    let hres = vec![
        HresConfig { name: "fast".to_string(), nodes: vec!["n0".to_string(), "n1".to_string()], total: 2, mode: HresMode::Mode1 },
        HresConfig { name: "fast".to_string(), nodes: vec!["n2".to_string(), "n3".to_string()], total: 1, mode: HresMode::Mode1 },
    ];
    let pool = LicensePool::new();
    pool.init("", &hres, false, &nodes, 0).unwrap();

    let mut job = make_job(1);
    job.license_list = pool.validate("fast:2", true, true, false, None).unwrap();
    assert!(job.license_list[0].id.hres_id.is_some());

    let mut bitmap = NodeBitmap::full(4);
    pool.hres_filter(&job, &mut bitmap);
    assert!(bitmap.test(0));
    assert!(bitmap.test(1));
    assert!(!bitmap.test(2));
    assert!(!bitmap.test(3));
}

/// Mode2 is an inclusive filter: sibling nodes remain eligible unless
/// their sibling cannot satisfy the request.
#[test]
fn test_hres_mode2_subtracts_failing_siblings() {
    let nodes = make_nodes(4);
    let hres = vec![
        HresConfig { name: "io".to_string(), nodes: vec!["n0".to_string(), "n1".to_string()], total: 3, mode: HresMode::Mode2 },
        HresConfig { name: "io".to_string(), nodes: vec!["n2".to_string(), "n3".to_string()], total: 1, mode: HresMode::Mode2 },
    ];
    let pool = LicensePool::new();
    pool.init("", &hres, false, &nodes, 0).unwrap();

    let mut job = make_job(1);
    job.license_list = pool.validate("io:2", true, true, false, None).unwrap();

    let mut bitmap = NodeBitmap::full(4);
    pool.hres_filter(&job, &mut bitmap);
    assert!(bitmap.test(0));
    assert!(bitmap.test(1));
    assert!(!bitmap.test(2));
    assert!(!bitmap.test(3));
}

#[test]
fn test_remote_sync_updates_and_removes() {
    use gridsched::license::pool::RemoteRecord;

    let nodes = make_nodes(2);
    let pool = LicensePool::new();
    pool.init("local:1", &[], false, &nodes, 0).unwrap();

    let rec = RemoteRecord {
        name: "ansys".to_string(),
        server: "flex1".to_string(),
        count: 10,
        allowed: 50,
        absolute: false,
        last_consumed: 0,
        last_update: 5,
    };
    pool.sync_remote(&[rec.clone()], 5);
    let snap = pool.snapshot();
    let remote = snap.iter().find(|l| l.name == "ansys@flex1").expect("remote license present");
    // 50 percent of 10 total.
    assert_eq!(remote.total, 5);

    // A consumer outside our tracking produces a deficit.
    let mut rec2 = rec.clone();
    rec2.last_consumed = 8;
    pool.sync_remote(&[rec2], 6);
    let snap = pool.snapshot();
    let remote = snap.iter().find(|l| l.name == "ansys@flex1").unwrap();
    assert_eq!(remote.last_deficit, 3);

    // Absent from the next sync: removed.
    pool.sync_remote(&[], 7);
    assert!(!pool.snapshot().iter().any(|l| l.name == "ansys@flex1"));
    // Local entries survive sync walks.
    assert!(pool.snapshot().iter().any(|l| l.name == "local"));
}
