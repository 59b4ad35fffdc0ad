use std::cmp::Ordering;

/// Compare dotted firmware versions with mixed numeric/alpha segments.
/// Numeric prefixes compare numerically, alpha remainders lexically, and a
/// missing segment counts as zero, so "1.2" == "1.2.0" and "1.2" < "1.10".
pub fn compare_versions(a: &str, b: &str) -> Ordering {
    let sa = segments(a);
    let sb = segments(b);
    let len = sa.len().max(sb.len());
    for i in 0..len {
        let da = sa.get(i).cloned().unwrap_or_default();
        let db = sb.get(i).cloned().unwrap_or_default();
        match da.cmp_segment(&db) {
            Ordering::Equal => continue,
            other => return other,
        }
    }
    Ordering::Equal
}

pub fn needs_update(device: &str, image: &str) -> bool {
    compare_versions(device, image) == Ordering::Less
}

pub fn is_downgrade(device: &str, image: &str) -> bool {
    compare_versions(device, image) == Ordering::Greater
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct Segment {
    num: u64,
    alpha: String,
}

impl Segment {
    fn cmp_segment(&self, other: &Self) -> Ordering {
        self.num
            .cmp(&other.num)
            .then_with(|| self.alpha.cmp(&other.alpha))
    }
}

fn segments(version: &str) -> Vec<Segment> {
    version
        .trim()
        .split(['.', '-', '_'])
        .map(|seg| {
            let digits: String = seg.chars().take_while(char::is_ascii_digit).collect();
            let alpha = seg[digits.len()..].to_ascii_lowercase();
            Segment {
                num: digits.parse().unwrap_or(0),
                alpha,
            }
        })
        .collect()
}
