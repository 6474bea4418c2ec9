//! Temporal merge of shard hits into scene intervals
//!
//! Hits are folded left to right. A hit joins the first existing cluster of the
//! same media and file whose `from` or `to` lies strictly within `window`
//! seconds of it; otherwise it starts a new cluster. Joining widens the
//! `[from, to]` envelope and adopts the hit's distance and time only when its
//! distance is strictly smaller.
//!
//! Cost is O(n·k) for n hits and k clusters, with n bounded by rows × shards.

use std::cmp::Ordering;

/// One shard document: `<mediaId>/<fileId>/<timestamp>` at distance `d`
#[derive(Debug, Clone, PartialEq)]
pub struct Hit {
    pub media_id: u64,
    pub file_id: String,
    pub time: f64,
    pub distance: f64,
}

impl Hit {
    /// Parse a shard document id; `None` when it is not `<u64>/<file>/<f64>`
    ///
    /// The file id is everything between the first and the last slash.
    pub fn parse(id: &str, distance: f64) -> Option<Hit> {
        let (media, rest) = id.split_once('/')?;
        let (file, time) = rest.rsplit_once('/')?;
        if file.is_empty() {
            return None;
        }
        let time: f64 = time.parse().ok()?;
        if !time.is_finite() {
            return None;
        }
        Some(Hit {
            media_id: media.parse().ok()?,
            file_id: file.to_string(),
            time,
            distance,
        })
    }
}

/// Scene interval accumulated from nearby hits of one file
#[derive(Debug, Clone, PartialEq)]
pub struct MatchCluster {
    pub media_id: u64,
    pub file_id: String,
    /// Lowest distance seen so far
    pub distance: f64,
    pub from: f64,
    pub to: f64,
    /// Time of the lowest-distance hit (best frame). Links anchor on
    /// `midpoint()`; this is kept for match logging.
    pub anchor_time: f64,
}

impl MatchCluster {
    fn singleton(hit: Hit) -> Self {
        Self {
            media_id: hit.media_id,
            file_id: hit.file_id,
            distance: hit.distance,
            from: hit.time,
            to: hit.time,
            anchor_time: hit.time,
        }
    }

    fn accepts(&self, hit: &Hit, window: f64) -> bool {
        self.media_id == hit.media_id
            && self.file_id == hit.file_id
            && ((self.from - hit.time).abs() < window || (self.to - hit.time).abs() < window)
    }

    fn absorb(&mut self, hit: Hit) {
        self.from = self.from.min(hit.time);
        self.to = self.to.max(hit.time);
        if hit.distance < self.distance {
            self.distance = hit.distance;
            self.anchor_time = hit.time;
        }
    }

    /// Middle of the interval, used as the preview anchor
    pub fn midpoint(&self) -> f64 {
        self.from + (self.to - self.from) / 2.0
    }
}

/// Fold hits into clusters, first matching cluster wins
pub fn merge_hits<I>(hits: I, window: f64) -> Vec<MatchCluster>
where
    I: IntoIterator<Item = Hit>,
{
    let mut clusters: Vec<MatchCluster> = Vec::new();
    for hit in hits {
        match clusters.iter_mut().find(|c| c.accepts(&hit, window)) {
            Some(cluster) => cluster.absorb(hit),
            None => clusters.push(MatchCluster::singleton(hit)),
        }
    }
    clusters
}

/// Keep the `limit` lowest-distance clusters in ascending distance order
pub fn top_matches(mut clusters: Vec<MatchCluster>, limit: usize) -> Vec<MatchCluster> {
    clusters.sort_by(|a, b| a.distance.partial_cmp(&b.distance).unwrap_or(Ordering::Equal));
    clusters.truncate(limit);
    clusters
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hit(media_id: u64, file: &str, time: f64, distance: f64) -> Hit {
        Hit {
            media_id,
            file_id: file.to_string(),
            time,
            distance,
        }
    }

    /// Order-independent view of a cluster set
    fn normalized(mut clusters: Vec<MatchCluster>) -> Vec<(u64, String, String, String, String)> {
        clusters.sort_by(|a, b| {
            (a.media_id, &a.file_id, a.from.to_bits()).cmp(&(b.media_id, &b.file_id, b.from.to_bits()))
        });
        clusters
            .into_iter()
            .map(|c| {
                (
                    c.media_id,
                    c.file_id,
                    c.from.to_string(),
                    c.to.to_string(),
                    c.distance.to_string(),
                )
            })
            .collect()
    }

    fn permutations<T: Clone>(items: &[T]) -> Vec<Vec<T>> {
        if items.len() <= 1 {
            return vec![items.to_vec()];
        }
        let mut out = Vec::new();
        for i in 0..items.len() {
            let mut rest = items.to_vec();
            let head = rest.remove(i);
            for mut tail in permutations(&rest) {
                tail.insert(0, head.clone());
                out.push(tail);
            }
        }
        out
    }

    #[test]
    fn test_overlapping_hits_merge_keeping_best_distance() {
        let clusters = merge_hits(vec![hit(1, "a", 10.0, 5.0), hit(1, "a", 12.0, 3.0)], 5.0);

        assert_eq!(
            clusters,
            vec![MatchCluster {
                media_id: 1,
                file_id: "a".to_string(),
                distance: 3.0,
                from: 10.0,
                to: 12.0,
                anchor_time: 12.0,
            }]
        );
    }

    #[test]
    fn test_worse_hit_extends_envelope_but_keeps_anchor() {
        let clusters = merge_hits(vec![hit(1, "a", 10.0, 3.0), hit(1, "a", 8.0, 9.0)], 5.0);
        assert_eq!(clusters.len(), 1);
        assert_eq!(clusters[0].from, 8.0);
        assert_eq!(clusters[0].to, 10.0);
        assert_eq!(clusters[0].distance, 3.0);
        assert_eq!(clusters[0].anchor_time, 10.0);
    }

    #[test]
    fn test_equal_distance_keeps_first_anchor() {
        let clusters = merge_hits(vec![hit(1, "a", 10.0, 4.0), hit(1, "a", 11.0, 4.0)], 5.0);
        assert_eq!(clusters[0].anchor_time, 10.0);
    }

    #[test]
    fn test_window_boundary_primary() {
        let apart = merge_hits(vec![hit(1, "a", 10.0, 1.0), hit(1, "a", 15.0, 1.0)], 5.0);
        assert_eq!(apart.len(), 2);

        let near = merge_hits(vec![hit(1, "a", 10.0, 1.0), hit(1, "a", 14.999, 1.0)], 5.0);
        assert_eq!(near.len(), 1);
    }

    #[test]
    fn test_window_boundary_legacy() {
        let apart = merge_hits(vec![hit(1, "a", 10.0, 1.0), hit(1, "a", 12.0, 1.0)], 2.0);
        assert_eq!(apart.len(), 2);

        let near = merge_hits(vec![hit(1, "a", 10.0, 1.0), hit(1, "a", 11.999, 1.0)], 2.0);
        assert_eq!(near.len(), 1);
    }

    #[test]
    fn test_window_measured_from_either_end() {
        // 10 → 14 widens to [10, 14]; 18 is 4s from `to` but 8s from `from`
        let clusters = merge_hits(
            vec![hit(1, "a", 10.0, 2.0), hit(1, "a", 14.0, 2.0), hit(1, "a", 18.0, 2.0)],
            5.0,
        );
        assert_eq!(clusters.len(), 1);
        assert_eq!((clusters[0].from, clusters[0].to), (10.0, 18.0));
    }

    #[test]
    fn test_different_media_or_file_never_merge() {
        let clusters = merge_hits(
            vec![hit(1, "a", 10.0, 1.0), hit(2, "a", 10.0, 1.0), hit(1, "b", 10.0, 1.0)],
            5.0,
        );
        assert_eq!(clusters.len(), 3);
    }

    #[test]
    fn test_first_created_cluster_wins() {
        // Two clusters for the same file, 6s apart; a hit between them is
        // within the window of both and must join the older one.
        let clusters = merge_hits(
            vec![hit(1, "a", 10.0, 5.0), hit(1, "a", 16.0, 5.0), hit(1, "a", 13.0, 1.0)],
            5.0,
        );
        assert_eq!(clusters.len(), 2);
        assert_eq!((clusters[0].from, clusters[0].to), (10.0, 13.0));
        assert_eq!(clusters[0].distance, 1.0);
        assert_eq!((clusters[1].from, clusters[1].to), (16.0, 16.0));
    }

    #[test]
    fn test_merge_is_order_independent() {
        let hits = vec![
            hit(1, "a", 10.0, 5.0),
            hit(1, "a", 12.0, 3.0),
            hit(1, "a", 13.5, 4.0),
            hit(1, "a", 100.0, 7.0),
            hit(2, "ep1", 10.0, 2.0),
            hit(1, "b", 11.0, 6.0),
        ];
        let expected = normalized(merge_hits(hits.clone(), 5.0));
        assert_eq!(expected.len(), 4);

        for permuted in permutations(&hits) {
            assert_eq!(normalized(merge_hits(permuted, 5.0)), expected);
        }
    }

    #[test]
    fn test_top_matches_sorts_ascending_and_truncates() {
        let clusters: Vec<MatchCluster> = (0..15)
            .map(|i| MatchCluster::singleton(hit(i, "f", 0.0, (15 - i) as f64)))
            .collect();

        let top = top_matches(clusters, 10);
        assert_eq!(top.len(), 10);
        assert_eq!(top[0].distance, 1.0);
        assert!(top.windows(2).all(|w| w[0].distance <= w[1].distance));
    }

    #[test]
    fn test_midpoint() {
        let mut cluster = MatchCluster::singleton(hit(1, "a", 10.0, 1.0));
        cluster.absorb(hit(1, "a", 13.0, 2.0));
        assert_eq!(cluster.midpoint(), 11.5);
    }

    #[test]
    fn test_parse_document_id() {
        assert_eq!(
            Hit::parse("21034/[Group] Show - 01.mp4/283.75", 4.5),
            Some(hit(21034, "[Group] Show - 01.mp4", 283.75, 4.5))
        );
        assert_eq!(
            Hit::parse("1/dir/file.mp4/3", 1.0).map(|h| h.file_id),
            Some("dir/file.mp4".to_string())
        );
        assert_eq!(Hit::parse("abc/file/1", 1.0), None);
        assert_eq!(Hit::parse("1/file", 1.0), None);
        assert_eq!(Hit::parse("1//2", 1.0), None);
    }
}
