use super::*;

fn pool(urls: &[&str], policy: Policy) -> BackendPool {
    let urls: Vec<String> = urls.iter().map(|s| s.to_string()).collect();
    BackendPool::new(&urls, policy).unwrap()
}

#[test]
fn new_rejects_empty_list() {
    assert!(matches!(BackendPool::new(&[], Policy::RoundRobin), Err(PoolError::Empty)));
}

#[test]
fn new_rejects_relative_url() {
    let urls = vec!["localhost:9001".to_string()];
    let err = BackendPool::new(&urls, Policy::RoundRobin).unwrap_err();
    assert!(matches!(err, PoolError::NotAbsolute { index: 0, .. }));
}

#[test]
fn new_rejects_unparseable_url() {
    let urls = vec!["http://".to_string()];
    assert!(BackendPool::new(&urls, Policy::RoundRobin).is_err());
}

#[test]
fn new_starts_all_backends_alive() {
    let p = pool(&["http://a:9001", "http://b:9002"], Policy::RoundRobin);
    assert!(p.snapshot().iter().all(|b| b.alive));
}

#[test]
fn round_robin_visits_each_backend_in_order() {
    let p = pool(&["http://a:9001", "http://b:9002", "http://c:9003"], Policy::RoundRobin);
    let picks: Vec<usize> = (0..6).map(|_| p.select().unwrap().0).collect();
    assert_eq!(picks, vec![0, 1, 2, 0, 1, 2]);
}

#[test]
fn round_robin_skips_dead_backends() {
    let p = pool(&["http://a:9001", "http://b:9002", "http://c:9003"], Policy::RoundRobin);
    p.mark_dead(1);

    let picks: Vec<usize> = (0..12).map(|_| p.select().unwrap().0).collect();
    assert!(picks.iter().all(|&i| i != 1), "dead backend was selected: {picks:?}");
    assert!(picks.contains(&0));
    assert!(picks.contains(&2));
}

#[test]
fn select_fails_only_when_all_dead() {
    let p = pool(&["http://a:9001", "http://b:9002"], Policy::RoundRobin);
    p.mark_dead(0);
    assert!(p.select().is_ok());
    p.mark_dead(1);
    assert_eq!(p.select().unwrap_err(), NoHealthyBackends);
}

#[test]
fn random_returns_only_alive_backends() {
    let p = pool(&["http://a:9001", "http://b:9002", "http://c:9003"], Policy::Random);
    p.mark_dead(0);

    let mut seen = std::collections::HashSet::new();
    for _ in 0..200 {
        let (index, backend) = p.select().unwrap();
        assert_ne!(index, 0, "dead backend selected");
        assert!(backend.is_alive());
        seen.insert(index);
    }
    // Uniform over the alive subset: both survivors show up in 200 draws.
    assert_eq!(seen, [1, 2].into_iter().collect());
}

#[test]
fn random_fails_when_all_dead() {
    let p = pool(&["http://a:9001", "http://b:9002"], Policy::Random);
    p.mark_dead(0);
    p.mark_dead(1);
    assert_eq!(p.select().unwrap_err(), NoHealthyBackends);
}

#[test]
fn mark_dead_and_alive_are_idempotent() {
    let p = pool(&["http://a:9001"], Policy::RoundRobin);
    p.mark_dead(0);
    p.mark_dead(0);
    assert!(!p.backends()[0].is_alive());
    p.mark_alive(0);
    p.mark_alive(0);
    assert!(p.backends()[0].is_alive());
}

#[test]
fn mark_out_of_range_is_ignored() {
    let p = pool(&["http://a:9001"], Policy::RoundRobin);
    p.mark_dead(7);
    assert!(p.backends()[0].is_alive());
}

#[test]
fn dead_backend_stays_excluded_until_revived() {
    let p = pool(&["http://a:9001", "http://b:9002"], Policy::RoundRobin);
    p.mark_dead(0);
    for _ in 0..5 {
        assert_eq!(p.select().unwrap().0, 1);
    }
    p.mark_alive(0);
    let picks: Vec<usize> = (0..4).map(|_| p.select().unwrap().0).collect();
    assert!(picks.contains(&0));
}

#[test]
fn snapshot_reflects_transitions() {
    let p = pool(&["http://a:9001", "http://b:9002"], Policy::RoundRobin);
    p.mark_dead(1);
    let snapshot = p.snapshot();
    assert!(snapshot[0].alive);
    assert!(!snapshot[1].alive);
    assert_eq!(snapshot[0].url.as_str(), "http://a:9001/");
}

#[test]
fn policy_parse_is_case_insensitive() {
    assert_eq!(Policy::parse("Round_Robin"), Some(Policy::RoundRobin));
    assert_eq!(Policy::parse("RANDOM"), Some(Policy::Random));
    assert_eq!(Policy::parse("weighted"), None);
}
