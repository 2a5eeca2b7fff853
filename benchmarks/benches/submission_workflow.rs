use ballot::ElectionPortal;
use ballot::config::PortalConfig;
use ballot::notify::LogNotifier;
use ballot::portal::VoterCredentials;
use ballot::reference::{ReferenceCatalog, ReferenceData, RegisteredVoters};
use ballot::store::InMemoryStore;
use ballot::tally::compute_standings;
use ballot::types::{
    AdministrativeUnit, Candidate, CandidateId, Office, OfficeId, OfficeLevel, Selections, UnitId,
    UnitLevel,
};
use criterion::{Criterion, criterion_group, criterion_main};
use std::hint::black_box;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

const WARD: UnitId = UnitId(111);

/// One county, two subcounties, two wards each; two candidates per office
fn small_catalog() -> ReferenceCatalog {
    let mut units = vec![AdministrativeUnit {
        id: UnitId(1),
        name: "Mombasa".to_string(),
        level: UnitLevel::County,
        parent_id: None,
    }];
    for subcounty in 1..=2u32 {
        let subcounty_id = UnitId(10 + subcounty);
        units.push(AdministrativeUnit {
            id: subcounty_id,
            name: format!("Subcounty {subcounty}"),
            level: UnitLevel::Subcounty,
            parent_id: Some(UnitId(1)),
        });
        for ward in 1..=2u32 {
            units.push(AdministrativeUnit {
                id: UnitId(subcounty_id.0 * 10 + ward),
                name: format!("Ward {ward}"),
                level: UnitLevel::Ward,
                parent_id: Some(subcounty_id),
            });
        }
    }

    let offices = [
        (1, "President", OfficeLevel::National, None),
        (2, "Governor", OfficeLevel::County, Some(UnitId(1))),
        (3, "Member of Parliament", OfficeLevel::Constituency, Some(UnitId(11))),
        (4, "Member of County Assembly", OfficeLevel::Ward, Some(WARD)),
    ];
    let mut candidates = Vec::new();
    for (id, _, level, bound) in offices {
        for n in 0..2 {
            candidates.push(Candidate {
                id: CandidateId(id * 10 + n),
                name: format!("Candidate {}", id * 10 + n),
                party: format!("Party {n}"),
                office_id: OfficeId(id),
                bound_location_id: bound,
                bound_location_level: bound.map(|_| level),
            });
        }
    }

    ReferenceCatalog {
        registered_voters: units
            .iter()
            .filter(|unit| unit.level == UnitLevel::Ward)
            .map(|unit| RegisteredVoters {
                location_id: unit.id,
                count: 10_000,
            })
            .collect(),
        units,
        offices: offices
            .iter()
            .map(|&(id, title, level, _)| Office {
                id: OfficeId(id),
                title: title.to_string(),
                level,
            })
            .collect(),
        candidates,
    }
}

fn build_portal() -> ElectionPortal {
    let reference = ReferenceData::from_catalog(small_catalog()).unwrap();
    ElectionPortal::new(
        &PortalConfig::for_testing(),
        reference,
        Arc::new(InMemoryStore::new()),
        Arc::new(LogNotifier),
    )
    .unwrap()
}

fn selections() -> Selections {
    [(1, 10), (2, 20), (3, 30), (4, 40)]
        .into_iter()
        .map(|(office, candidate)| (OfficeId(office), CandidateId(candidate)))
        .collect()
}

fn credentials(n: u64) -> VoterCredentials {
    VoterCredentials {
        id_number: format!("{n:08}"),
        first_name: "Bench".to_string(),
        last_name: "Voter".to_string(),
        phone: None,
        location_id: WARD,
    }
}

fn bench_submission(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let portal = rt.block_on(async { build_portal() });
    let portal = &portal;
    let next_voter = &AtomicU64::new(0);

    let mut group = c.benchmark_group("submission");
    group.warm_up_time(Duration::from_millis(100));

    // Fresh voter every iteration so each one runs all four phases
    group.bench_function("login_and_cast", |b| {
        b.to_async(&rt).iter(|| async move {
            let n = next_voter.fetch_add(1, Ordering::Relaxed);
            let login = portal.login(credentials(n)).await.unwrap();
            let receipt = portal
                .cast(&login.token, black_box(selections()))
                .await
                .unwrap();
            black_box(receipt);
        })
    });

    group.bench_function("duplicate_rejection", |b| {
        let token = rt.block_on(async {
            let first = portal.login(credentials(u64::MAX)).await.unwrap();
            let spare = portal.login(credentials(u64::MAX)).await.unwrap();
            portal.cast(&first.token, selections()).await.unwrap();
            spare.token
        });
        let token = &token;
        b.to_async(&rt).iter(|| async move {
            // The spare session is ended by the first rejection, so later
            // iterations exercise the session check
            black_box(portal.cast(token, selections()).await.is_err());
        })
    });

    group.finish();
}

fn bench_monitor(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let portal = rt.block_on(async {
        let portal = build_portal();
        for n in 0..500 {
            let login = portal.login(credentials(n)).await.unwrap();
            portal.cast(&login.token, selections()).await.unwrap();
        }
        portal
    });
    let portal = &portal;

    let mut group = c.benchmark_group("monitor");
    group.warm_up_time(Duration::from_millis(100));

    let monitor = &portal.open_monitor().unwrap();
    group.bench_function("national_view", |b| {
        b.to_async(&rt)
            .iter(|| async move { black_box(portal.monitor_view(monitor).await.unwrap()) })
    });

    let ward_monitor = &portal.open_monitor().unwrap();
    portal.narrow_monitor(ward_monitor, UnitId(1)).unwrap();
    portal.narrow_monitor(ward_monitor, UnitId(11)).unwrap();
    portal.narrow_monitor(ward_monitor, WARD).unwrap();
    group.bench_function("ward_view", |b| {
        b.to_async(&rt)
            .iter(|| async move { black_box(portal.monitor_view(ward_monitor).await.unwrap()) })
    });

    let counts: Vec<(CandidateId, u64)> = (0..50)
        .map(|i| (CandidateId(i), (i as u64 * 7) % 13))
        .collect();
    group.bench_function("compute_standings", |b| {
        b.iter(|| compute_standings(black_box(&counts)))
    });

    group.finish();
}

criterion_group!(benches, bench_submission, bench_monitor);
criterion_main!(benches);
