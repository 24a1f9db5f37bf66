use std::sync::atomic::{AtomicI32, Ordering};

/// A strictly increasing request id allocator scoped to a single [`Connection`](crate::cmap::Connection).
///
/// Wraps modulo 2^31 back to 0 rather than going negative, since `responseTo` correlation
/// only needs distinctness among concurrently in-flight requests, never a global total order
/// (spec.md §3, RequestId).
#[derive(Debug, Default)]
pub(crate) struct RequestIdGenerator {
    next: AtomicI32,
}

impl RequestIdGenerator {
    pub(crate) fn new() -> Self {
        Self {
            next: AtomicI32::new(0),
        }
    }

    pub(crate) fn next(&self) -> i32 {
        loop {
            let current = self.next.load(Ordering::Relaxed);
            let next = if current == i32::MAX { 0 } else { current + 1 };
            if self
                .next
                .compare_exchange_weak(current, next, Ordering::Relaxed, Ordering::Relaxed)
                .is_ok()
            {
                return current;
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;

    #[test]
    fn ids_are_unique_under_concurrency() {
        let gen = Arc::new(RequestIdGenerator::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let gen = gen.clone();
                std::thread::spawn(move || (0..500).map(|_| gen.next()).collect::<Vec<_>>())
            })
            .collect();
        let mut ids: Vec<i32> = handles.into_iter().flat_map(|h| h.join().unwrap()).collect();
        let set: HashSet<_> = ids.iter().copied().collect();
        ids.sort();
        assert_eq!(set.len(), ids.len());
    }

    #[test]
    fn wraps_at_i32_max() {
        let gen = RequestIdGenerator::new();
        gen.next.store(i32::MAX, Ordering::Relaxed);
        assert_eq!(gen.next(), i32::MAX);
        assert_eq!(gen.next(), 0);
    }
}
