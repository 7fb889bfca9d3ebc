use rand::Rng;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SelectionError {
    #[error("{available} devices available; {requested} devices needed")]
    NotEnoughDevices { available: usize, requested: usize },
    #[error("device index {index} out of range for a catalog of {len}")]
    IndexOutOfRange { index: usize, len: usize },
    #[error("malformed device spec {0:?}")]
    BadSpec(String),
    #[error("root complex sizes cover {expected} devices, catalog holds {actual}")]
    GroupMismatch { expected: usize, actual: usize },
}

/// Partition the catalog indices `0..total` into root complex groups.
///
/// An empty `sizes` means the grouping is unknown and everything lands in a
/// single group.
pub fn root_complex_groups(
    total: usize,
    sizes: &[usize],
) -> Result<Vec<Vec<usize>>, SelectionError> {
    if sizes.is_empty() {
        return Ok(vec![(0..total).collect()]);
    }
    let expected: usize = sizes.iter().sum();
    if expected != total {
        return Err(SelectionError::GroupMismatch {
            expected,
            actual: total,
        });
    }
    let mut groups = Vec::with_capacity(sizes.len());
    let mut next = 0;
    for size in sizes {
        groups.push((next..next + size).collect());
        next += size;
    }
    Ok(groups)
}

/// Walk the groups cyclically from `start`, taking one randomly chosen
/// member out of each non-empty group, until `count` indices are picked.
fn cycle_pick<R: Rng + ?Sized>(
    mut groups: Vec<Vec<usize>>,
    count: usize,
    start: usize,
    rng: &mut R,
) -> Result<Vec<usize>, SelectionError> {
    let available: usize = groups.iter().map(Vec::len).sum();
    if count > available {
        return Err(SelectionError::NotEnoughDevices {
            available,
            requested: count,
        });
    }
    let mut picked = Vec::with_capacity(count);
    let mut cur = start;
    while picked.len() < count {
        let group = &mut groups[cur];
        if !group.is_empty() {
            picked.push(group.swap_remove(rng.random_range(0..group.len())));
        }
        cur = (cur + 1) % groups.len();
    }
    Ok(picked)
}

/// Pick `count` devices by cycling over the root complexes so that no single
/// complex is saturated when the count is small.
pub fn round_robin<R: Rng + ?Sized>(
    names: &[String],
    sizes: &[usize],
    count: usize,
    rng: &mut R,
) -> Result<Vec<String>, SelectionError> {
    let groups = root_complex_groups(names.len(), sizes)?;
    let picked = cycle_pick(groups, count, 0, rng)?;
    debug!("round robin selection: {picked:?}");
    Ok(picked.into_iter().map(|i| names[i].clone()).collect())
}

/// Balanced device index assignment, starting from a random root complex.
pub fn assignment<R: Rng + ?Sized>(
    total: usize,
    sizes: &[usize],
    count: usize,
    rng: &mut R,
) -> Result<Vec<usize>, SelectionError> {
    let groups = root_complex_groups(total, sizes)?;
    let start = rng.random_range(0..groups.len());
    cycle_pick(groups, count, start, rng)
}

/// The first `count` devices in catalog order.
pub fn first_n(names: &[String], count: usize) -> Result<Vec<String>, SelectionError> {
    if count > names.len() {
        return Err(SelectionError::NotEnoughDevices {
            available: names.len(),
            requested: count,
        });
    }
    Ok(names[..count].to_vec())
}

/// Resolve explicit device numbers. An element is either a single index or
/// an inclusive `start-end` range.
pub fn by_spec(names: &[String], specs: &[String]) -> Result<Vec<String>, SelectionError> {
    let mut numbers = Vec::new();
    for spec in specs {
        let spec = spec.trim();
        match spec.split_once('-') {
            Some((start, end)) => {
                let start: usize = start
                    .trim()
                    .parse()
                    .map_err(|_| SelectionError::BadSpec(spec.to_owned()))?;
                let end: usize = end
                    .trim()
                    .parse()
                    .map_err(|_| SelectionError::BadSpec(spec.to_owned()))?;
                if end < start {
                    return Err(SelectionError::BadSpec(spec.to_owned()));
                }
                numbers.extend(start..=end);
            }
            None => numbers.push(
                spec.parse()
                    .map_err(|_| SelectionError::BadSpec(spec.to_owned()))?,
            ),
        }
    }
    numbers
        .into_iter()
        .map(|index| {
            names
                .get(index)
                .cloned()
                .ok_or(SelectionError::IndexOutOfRange {
                    index,
                    len: names.len(),
                })
        })
        .collect()
}

/// Join targets into fio's `--filename` form. Literal `:` separates targets,
/// so one inside a path is escaped.
pub fn join_targets(names: &[String]) -> String {
    names
        .iter()
        .map(|name| name.replace(':', r"\:"))
        .collect::<Vec<_>>()
        .join(":")
}

#[cfg(test)]
mod tests {
    use rand::{SeedableRng, rngs::StdRng};

    use super::*;

    fn catalog(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("dev{i}")).collect()
    }

    #[test]
    fn groups_follow_sizes() {
        let groups = root_complex_groups(30, &[7, 7, 8, 8]).unwrap();
        assert_eq!(groups.len(), 4);
        assert_eq!(groups[0], (0..7).collect::<Vec<_>>());
        assert_eq!(groups[2], (14..22).collect::<Vec<_>>());
        assert_eq!(groups[3], (22..30).collect::<Vec<_>>());
    }

    #[test]
    fn groups_reject_size_mismatch() {
        assert_eq!(
            root_complex_groups(29, &[7, 7, 8, 8]),
            Err(SelectionError::GroupMismatch {
                expected: 30,
                actual: 29
            })
        );
    }

    #[test]
    fn round_robin_spreads_over_complexes() {
        let names = catalog(30);
        let mut rng = StdRng::seed_from_u64(7);
        let picked = round_robin(&names, &[7, 7, 8, 8], 4, &mut rng).unwrap();
        assert_eq!(picked.len(), 4);
        // one device per complex
        let complex_of = |name: &String| {
            let idx: usize = name.strip_prefix("dev").unwrap().parse().unwrap();
            match idx {
                0..7 => 0,
                7..14 => 1,
                14..22 => 2,
                _ => 3,
            }
        };
        let mut complexes: Vec<usize> = picked.iter().map(complex_of).collect();
        complexes.sort_unstable();
        assert_eq!(complexes, vec![0, 1, 2, 3]);
    }

    #[test]
    fn round_robin_never_duplicates() {
        let names = catalog(30);
        let mut rng = StdRng::seed_from_u64(11);
        let mut picked = round_robin(&names, &[7, 7, 8, 8], 28, &mut rng).unwrap();
        picked.sort();
        picked.dedup();
        assert_eq!(picked.len(), 28);
    }

    #[test]
    fn round_robin_rejects_overcount() {
        let names = catalog(30);
        let mut rng = StdRng::seed_from_u64(0);
        assert_eq!(
            round_robin(&names, &[7, 7, 8, 8], 31, &mut rng),
            Err(SelectionError::NotEnoughDevices {
                available: 30,
                requested: 31
            })
        );
    }

    #[test]
    fn assignment_exhausts_catalog() {
        let mut rng = StdRng::seed_from_u64(3);
        let mut picked = assignment(30, &[7, 7, 8, 8], 30, &mut rng).unwrap();
        picked.sort_unstable();
        assert_eq!(picked, (0..30).collect::<Vec<_>>());
    }

    #[test]
    fn first_n_keeps_catalog_order() {
        let names = catalog(5);
        assert_eq!(first_n(&names, 3).unwrap(), vec!["dev0", "dev1", "dev2"]);
        assert!(first_n(&names, 6).is_err());
    }

    #[test]
    fn spec_accepts_indices_and_ranges() {
        let names = catalog(12);
        let picked = by_spec(
            &names,
            &["3".to_owned(), "7-10".to_owned(), "0".to_owned()],
        )
        .unwrap();
        assert_eq!(picked, vec!["dev3", "dev7", "dev8", "dev9", "dev10", "dev0"]);
    }

    #[test]
    fn spec_rejects_bad_input() {
        let names = catalog(4);
        assert_eq!(
            by_spec(&names, &["9".to_owned()]),
            Err(SelectionError::IndexOutOfRange { index: 9, len: 4 })
        );
        assert_eq!(
            by_spec(&names, &["two".to_owned()]),
            Err(SelectionError::BadSpec("two".to_owned()))
        );
        assert_eq!(
            by_spec(&names, &["3-1".to_owned()]),
            Err(SelectionError::BadSpec("3-1".to_owned()))
        );
    }

    #[test]
    fn join_escapes_colons() {
        let names = vec!["/dev/disk/by-path/pci-0000:01:00.0-nvme-1".to_owned(), "/mnt/ssd1/fio".to_owned()];
        assert_eq!(
            join_targets(&names),
            r"/dev/disk/by-path/pci-0000\:01\:00.0-nvme-1:/mnt/ssd1/fio"
        );
    }
}
