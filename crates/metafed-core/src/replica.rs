//! Replica selection pipeline
//!
//! After a locate completes, the raw replica set is filtered (drop
//! unusable replicas and replicas on unusable backends) and then run
//! through an ordered chain of filters. The stock chain holds one
//! filter, the geographic sorter; deployments can prepend or append
//! their own.

use crate::record::Replica;
use rand::seq::SliceRandom;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::debug;

/// What is known about the requesting client
#[derive(Clone, Debug, Default)]
pub struct ClientInfo {
    pub ip: String,
    pub latitude: f64,
    pub longitude: f64,
}

/// One stage of the replica pipeline
pub trait ReplicaFilter: Send + Sync {
    fn name(&self) -> &str;

    /// Reorder or drop replicas in place
    fn apply(&self, replicas: &mut Vec<Replica>, client: &ClientInfo);

    /// Called once when a replica is first discovered, before it is
    /// stored. Filters use this to annotate replicas with what they
    /// will later need.
    fn hook_new_replica(&self, _replica: &mut Replica) {}
}

const EARTH_RADIUS_KM: f64 = 6371.0;

/// Sorts replicas by their distance from the client, nearest first.
///
/// Distance is the squared equirectangular approximation in radians,
/// which preserves ordering without any trigonometric inverse. The
/// fuzz radius turns near-ties into explicit ties: contiguous runs of
/// replicas whose distances fall within the fuzz of the run's nearest
/// member are shuffled, spreading load across equivalent sites while
/// keeping the global near-to-far order.
pub struct GeoSorter {
    /// Normalized as (km / earth radius)^2 so it compares directly
    /// against the squared distances
    fuzz: f64,
    /// Static host -> (latitude, longitude, site label) table
    locations: BTreeMap<String, (f64, f64, String)>,
}

impl GeoSorter {
    #[must_use]
    pub fn new(fuzz_km: f64) -> Self {
        let normalized = fuzz_km / EARTH_RADIUS_KM;
        Self {
            fuzz: normalized * normalized,
            locations: BTreeMap::new(),
        }
    }

    pub fn add_location(&mut self, host: &str, latitude: f64, longitude: f64, label: &str) {
        self.locations
            .insert(host.to_string(), (latitude, longitude, label.to_string()));
    }

    fn distance2(client: &ClientInfo, replica: &Replica) -> f64 {
        let lat1 = client.latitude.to_radians();
        let lon1 = client.longitude.to_radians();
        let lat2 = replica.latitude.to_radians();
        let lon2 = replica.longitude.to_radians();
        let x = (lon2 - lon1) * (f64::midpoint(lat1, lat2)).cos();
        let y = lat2 - lat1;
        x.mul_add(x, y * y)
    }
}

impl ReplicaFilter for GeoSorter {
    fn name(&self) -> &str {
        "geo"
    }

    fn apply(&self, replicas: &mut Vec<Replica>, client: &ClientInfo) {
        let mut keyed: Vec<(f64, Replica)> = replicas
            .drain(..)
            .map(|r| (Self::distance2(client, &r), r))
            .collect();
        keyed.sort_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(std::cmp::Ordering::Equal));

        let dists: Vec<f64> = keyed.iter().map(|(d, _)| *d).collect();
        let mut rng = rand::thread_rng();
        for run in fuzz_runs(&dists, self.fuzz) {
            if run.len() > 1 {
                keyed[run].shuffle(&mut rng);
            }
        }
        replicas.extend(keyed.into_iter().map(|(_, r)| r));
    }

    fn hook_new_replica(&self, replica: &mut Replica) {
        let Some(host) = host_of(&replica.name) else {
            return;
        };
        if let Some((lat, lon, label)) = self.locations.get(host) {
            replica.latitude = *lat;
            replica.longitude = *lon;
            replica.location.clone_from(label);
        }
    }
}

/// Split sorted distances into maximal runs where every member lies
/// within `fuzz` of the run's first (nearest) member. The boundary is
/// inclusive: a member exactly `fuzz` away still joins the run.
fn fuzz_runs(dists: &[f64], fuzz: f64) -> Vec<std::ops::Range<usize>> {
    let mut runs = Vec::new();
    let mut start = 0;
    for i in 1..=dists.len() {
        if i == dists.len() || dists[i] - dists[start] > fuzz {
            runs.push(start..i);
            start = i;
        }
    }
    runs
}

/// Host part of a `scheme://host/path` replica name
fn host_of(url: &str) -> Option<&str> {
    let rest = url.split_once("://")?.1;
    Some(rest.split('/').next().unwrap_or(rest))
}

/// Ordered filter chain applied to every located replica set
pub struct ReplicaPipeline {
    filters: Vec<Arc<dyn ReplicaFilter>>,
}

impl ReplicaPipeline {
    #[must_use]
    pub fn new() -> Self {
        Self {
            filters: Vec::new(),
        }
    }

    pub fn push(&mut self, filter: Arc<dyn ReplicaFilter>) {
        self.filters.push(filter);
    }

    /// Annotate a freshly discovered replica through every filter
    pub fn on_new_replica(&self, replica: &mut Replica) {
        for f in &self.filters {
            f.hook_new_replica(replica);
        }
    }

    /// Drop unusable replicas, then run the filter chain.
    /// `backend_ok(id)` reports whether the owning backend is currently
    /// trusted; its replicas are dropped otherwise.
    pub fn run(
        &self,
        replicas: &mut Vec<Replica>,
        client: &ClientInfo,
        backend_ok: &dyn Fn(usize) -> bool,
    ) {
        let before = replicas.len();
        replicas.retain(|r| {
            r.status == crate::record::ReplicaStatus::Available && backend_ok(r.backend_id)
        });
        if replicas.len() < before {
            debug!(
                dropped = before - replicas.len(),
                kept = replicas.len(),
                "dropped unusable replicas"
            );
        }
        for f in &self.filters {
            f.apply(replicas, client);
        }
    }
}

impl Default for ReplicaPipeline {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::ReplicaStatus;

    fn replica_at(name: &str, lat: f64, lon: f64) -> Replica {
        Replica {
            name: name.to_string(),
            latitude: lat,
            longitude: lon,
            status: ReplicaStatus::Available,
            ..Replica::default()
        }
    }

    #[test]
    fn test_fuzz_runs_group_near_ties() {
        let dists = [1.0, 1.01, 1.02, 5.0, 5.01];
        let runs = fuzz_runs(&dists, 0.05);
        assert_eq!(runs, vec![0..3, 3..5]);
    }

    #[test]
    fn test_fuzz_boundary_is_inclusive() {
        // Exactly fuzz away from the run start still groups.
        let dists = [1.0, 1.5, 2.0];
        assert_eq!(fuzz_runs(&dists, 0.5), vec![0..2, 2..3]);
    }

    #[test]
    fn test_fuzz_zero_means_singleton_runs() {
        let dists = [1.0, 2.0, 3.0];
        assert_eq!(fuzz_runs(&dists, 0.0), vec![0..1, 1..2, 2..3]);
    }

    #[test]
    fn test_sorts_nearest_first_across_groups() {
        let geo = GeoSorter::new(10.0);
        let client = ClientInfo {
            latitude: 46.2,
            longitude: 6.1,
            ..ClientInfo::default()
        };
        // Two European sites near the client, one across the Atlantic.
        let mut reps = vec![
            replica_at("http://chicago/f", 41.9, -87.6),
            replica_at("http://geneva/f", 46.23, 6.05),
            replica_at("http://lyon/f", 45.76, 4.84),
        ];
        geo.apply(&mut reps, &client);
        // The far site always sorts last; the near pair may shuffle.
        assert_eq!(reps[2].name, "http://chicago/f");
        assert_eq!(reps[0].name, "http://geneva/f");
    }

    #[test]
    fn test_near_ties_stay_within_their_group() {
        let geo = GeoSorter::new(50.0);
        let client = ClientInfo {
            latitude: 46.2,
            longitude: 6.1,
            ..ClientInfo::default()
        };
        let near: Vec<&str> = vec!["http://a/f", "http://b/f"];
        let mut reps = vec![
            replica_at(near[0], 46.21, 6.11),
            replica_at(near[1], 46.22, 6.12),
            replica_at("http://far/f", 41.9, -87.6),
        ];
        geo.apply(&mut reps, &client);
        assert!(near.contains(&reps[0].name.as_str()));
        assert!(near.contains(&reps[1].name.as_str()));
        assert_eq!(reps[2].name, "http://far/f");
    }

    #[test]
    fn test_pipeline_drops_unusable_replicas() {
        let pipeline = ReplicaPipeline::new();
        let client = ClientInfo::default();
        let mut reps = vec![
            replica_at("http://ok/f", 0.0, 0.0),
            Replica {
                name: "http://broken/f".to_string(),
                status: ReplicaStatus::Unreachable,
                ..Replica::default()
            },
            Replica {
                name: "http://offline-backend/f".to_string(),
                backend_id: 9,
                status: ReplicaStatus::Available,
                ..Replica::default()
            },
        ];
        pipeline.run(&mut reps, &client, &|id| id != 9);
        assert_eq!(reps.len(), 1);
        assert_eq!(reps[0].name, "http://ok/f");
    }

    #[test]
    fn test_hook_annotates_known_hosts() {
        let mut geo = GeoSorter::new(10.0);
        geo.add_location("se1.example.org", 46.2, 6.1, "CH-Geneva");
        let mut rep = Replica {
            name: "davs://se1.example.org/data/f".to_string(),
            ..Replica::default()
        };
        geo.hook_new_replica(&mut rep);
        assert!((rep.latitude - 46.2).abs() < f64::EPSILON);
        assert_eq!(rep.location, "CH-Geneva");
    }

    #[test]
    fn test_host_parsing() {
        assert_eq!(host_of("http://host.example/f"), Some("host.example"));
        assert_eq!(host_of("davs://h"), Some("h"));
        assert_eq!(host_of("not-a-url"), None);
    }
}
