use std::num::NonZeroUsize;

use indexmap::IndexMap;

/// Top-N entries of a snapshot, ordered by descending total.
///
/// Equality is order-independent: two views are equal when they hold the
/// same codes with the same totals.
pub type TopView = IndexMap<String, i64>;

/// Limit used when a request supplies none, or an unusable one.
pub const DEFAULT_LIMIT: NonZeroUsize = match NonZeroUsize::new(10) {
    Some(n) => n,
    None => unreachable!(),
};

/// Select the `n` entries with the largest totals.
///
/// Entries with equal totals keep their relative order from `entries`, so
/// the result is reproducible for a given input.
pub fn select_top<'a, I>(entries: I, n: NonZeroUsize) -> TopView
where
    I: IntoIterator<Item = (&'a String, &'a i64)>,
{
    let mut ranked: Vec<(&String, &i64)> = entries.into_iter().collect();
    // `sort_by` is stable.
    ranked.sort_by(|a, b| b.1.cmp(a.1));

    ranked
        .into_iter()
        .take(n.get())
        .map(|(code, total)| (code.clone(), *total))
        .collect()
}

/// Resolve a raw `limit` request parameter.
///
/// Missing, non-numeric, zero and negative values fall back to `default`.
pub fn resolve_limit(raw: Option<&str>, default: NonZeroUsize) -> NonZeroUsize {
    raw.and_then(|s| s.trim().parse::<i64>().ok())
        .filter(|n| *n > 0)
        .and_then(|n| usize::try_from(n).ok())
        .and_then(NonZeroUsize::new)
        .unwrap_or(default)
}
