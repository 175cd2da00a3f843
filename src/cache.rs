//! Process-wide caches for expensive precomputations.
//!
//! Three pools live here, each behind its own mutex and shared through one
//! [`Caches`] handle that is created at library init and passed to renderers
//! explicitly (no hidden statics):
//!
//! * the gamma LUT pool, keyed by `(max value, gamma, gray range)`,
//! * the screen-tile cache, keyed by `(type, variant, blur, strip widths)`,
//! * the analyzer cache, keyed by the full content fingerprint of an
//!   analysis (image id, screen id, mesh id, transform parameters, mode,
//!   gamma, collection threshold).
//!
//! Lookups are serialized; on a miss the builder runs while the cache mutex
//! is held, so at most one analyzer build is in flight per cache, which
//! conservatively satisfies the two-builds-per-image scheduler bound. The
//! build itself parallelizes internally. Entries are handed out as `Arc`s;
//! releasing a reference is dropping it, and the LRU only evicts entries
//! nobody holds.

use std::sync::{Arc, Mutex};

use crate::analyze::{AnalyzeMode, AnyAnalyzer};
use crate::geometry::ScrToImgParameters;
use crate::screen::{Screen, ScreenType, StripWidths};
use crate::CoreResult;

/// Bounded LRU keyed by `PartialEq` on the key type. Entry count stays
/// small (tens), so a linear scan beats hashing parameter structs.
pub struct LruCache<K, V> {
    name: &'static str,
    inner: Mutex<LruInner<K, V>>,
}

struct LruInner<K, V> {
    capacity: usize,
    tick: u64,
    entries: Vec<(K, Arc<V>, u64)>,
}

impl<K: PartialEq + Clone, V> LruCache<K, V> {
    pub fn new(name: &'static str, capacity: usize) -> Self {
        Self {
            name,
            inner: Mutex::new(LruInner {
                capacity,
                tick: 0,
                entries: Vec::new(),
            }),
        }
    }

    pub fn set_capacity(&self, capacity: usize) {
        let mut inner = self.inner.lock().unwrap();
        inner.capacity = capacity;
        Self::evict(&mut inner);
    }

    pub fn capacity(&self) -> usize {
        self.inner.lock().unwrap().capacity
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Look up `key`, building and publishing the value on a miss. The
    /// builder may fail or be cancelled; nothing is published then.
    pub fn get_or_try_build(
        &self,
        key: K,
        build: impl FnOnce() -> CoreResult<V>,
    ) -> CoreResult<Arc<V>> {
        let mut inner = self.inner.lock().unwrap();
        inner.tick += 1;
        let tick = inner.tick;
        if let Some(entry) = inner.entries.iter_mut().find(|(k, _, _)| *k == key) {
            entry.2 = tick;
            tracing::trace!(cache = self.name, "cache hit");
            return Ok(entry.1.clone());
        }
        tracing::debug!(cache = self.name, "cache miss, building");
        let value = Arc::new(build()?);
        inner.entries.push((key, value.clone(), tick));
        Self::evict(&mut inner);
        Ok(value)
    }

    fn evict(inner: &mut LruInner<K, V>) {
        while inner.entries.len() > inner.capacity {
            // Oldest unreferenced entry; entries still held by callers are
            // pinned and skipped.
            let victim = inner
                .entries
                .iter()
                .enumerate()
                .filter(|(_, (_, v, _))| Arc::strong_count(v) == 1)
                .min_by_key(|(_, (_, _, t))| *t)
                .map(|(i, _)| i);
            match victim {
                Some(i) => {
                    inner.entries.remove(i);
                }
                None => break,
            }
        }
    }
}

fn bits(v: f64) -> u64 {
    v.to_bits()
}

/// Gamma lookup tables, refcounted process-wide. Tables are only rebuilt
/// when the key changes; otherwise borrowed.
pub struct LutPool {
    forward: LruCache<(u16, u64), Vec<f32>>,
    output: LruCache<(u32, u64, i32, i32), Vec<u16>>,
}

impl Default for LutPool {
    fn default() -> Self {
        Self::new()
    }
}

impl LutPool {
    pub fn new() -> Self {
        Self {
            forward: LruCache::new("forward LUT", 8),
            output: LruCache::new("output LUT", 8),
        }
    }

    /// raw value → linear 0..1 with the given scan gamma.
    pub fn forward(&self, maxval: u16, gamma: f64) -> Arc<Vec<f32>> {
        self.forward
            .get_or_try_build((maxval, bits(gamma)), || {
                let n = maxval as usize + 1;
                let mut t = Vec::with_capacity(n);
                for v in 0..n {
                    t.push((v as f64 / maxval as f64).powf(gamma) as f32);
                }
                Ok(t)
            })
            .expect("forward LUT build is infallible")
    }

    /// linear 0..1 (scaled to 16 bits) → output value: gray-range contrast
    /// stretch followed by the 1/2.2 output encoding. `gray_min`/`gray_max`
    /// are in the 0..255 UI scale.
    pub fn output(
        &self,
        dst_maxval: u32,
        gamma: f64,
        gray_min: i32,
        gray_max: i32,
    ) -> Arc<Vec<u16>> {
        self.output
            .get_or_try_build((dst_maxval, bits(gamma), gray_min, gray_max), || {
                let span = (gray_max - gray_min).max(1) as f64 / 255.0;
                let lo = gray_min as f64 / 255.0;
                let mut t = Vec::with_capacity(65536);
                for i in 0..65536usize {
                    let v = i as f64 / 65535.0;
                    let stretched = ((v - lo) / span).clamp(0.0, 1.0);
                    let encoded = stretched.powf(1.0 / gamma);
                    t.push((encoded * dst_maxval as f64 + 0.5) as u16);
                }
                Ok(t)
            })
            .expect("output LUT build is infallible")
    }
}

/// Which construction of the screen tile is wanted.
#[derive(Clone, Copy, PartialEq)]
enum ScreenVariant {
    Analytic,
    Preview,
    Empty,
}

/// Cache of screen tiles, including blurred variants.
pub struct ScreenCache {
    tiles: LruCache<(ScreenType, ScreenVariant, u64, u64, u64), Screen>,
}

impl Default for ScreenCache {
    fn default() -> Self {
        Self::new()
    }
}

impl ScreenCache {
    pub fn new() -> Self {
        Self {
            tiles: LruCache::new("screen tiles", 16),
        }
    }

    pub fn empty(&self) -> Arc<Screen> {
        self.tiles
            .get_or_try_build(
                (ScreenType::Random, ScreenVariant::Empty, 0, 0, 0),
                || Ok(Screen::empty()),
            )
            .expect("empty screen build is infallible")
    }

    /// Analytic tile, optionally Gaussian-blurred (radius in screen
    /// periods).
    pub fn get(
        &self,
        ty: ScreenType,
        blur_radius: f64,
        strips: StripWidths,
    ) -> CoreResult<Arc<Screen>> {
        let key = (
            ty,
            ScreenVariant::Analytic,
            bits(blur_radius.max(0.0)),
            bits(strips.red),
            bits(strips.green),
        );
        self.tiles.get_or_try_build(key, || {
            let base = Screen::analytic(ty, strips)?;
            if blur_radius > 0.0 {
                Ok(Screen::with_blur(&base, blur_radius))
            } else {
                Ok(base)
            }
        })
    }

    pub fn preview(&self, ty: ScreenType, strips: StripWidths) -> CoreResult<Arc<Screen>> {
        let key = (ty, ScreenVariant::Preview, 0, bits(strips.red), bits(strips.green));
        self.tiles.get_or_try_build(key, || Screen::preview(ty, strips))
    }
}

/// Fingerprint of one analysis; see the original cache key discussion in
/// the module docs.
#[derive(Clone, PartialEq)]
pub struct AnalyzerKey {
    pub image_id: u64,
    pub screen_id: u64,
    pub mesh_id: u64,
    pub gamma_bits: u64,
    pub mode: AnalyzeMode,
    pub collection_threshold_bits: u32,
    pub params: ScrToImgParameters,
}

const ANALYZER_CAPACITY: usize = 4;

/// The shared cache context. Create once, pass by reference (or clone the
/// `Arc` the application wraps it in).
pub struct Caches {
    pub luts: LutPool,
    pub screens: ScreenCache,
    pub analyzers: LruCache<AnalyzerKey, AnyAnalyzer>,
}

impl Default for Caches {
    fn default() -> Self {
        Self::new()
    }
}

impl Caches {
    pub fn new() -> Self {
        Self {
            luts: LutPool::new(),
            screens: ScreenCache::new(),
            analyzers: LruCache::new("analyzers", ANALYZER_CAPACITY),
        }
    }

    /// Stitch projects keep three analyzer modes alive per tile; triple the
    /// capacity while one is open.
    pub fn enter_stitch_mode(&self) {
        self.analyzers.set_capacity(ANALYZER_CAPACITY * 3);
    }

    pub fn leave_stitch_mode(&self) {
        self.analyzers.set_capacity(ANALYZER_CAPACITY);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lru_shares_and_evicts() {
        let cache: LruCache<u32, u32> = LruCache::new("test", 2);
        let a = cache.get_or_try_build(1, || Ok(10)).unwrap();
        let b = cache.get_or_try_build(1, || panic!("must hit")).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        drop((a, b));
        cache.get_or_try_build(2, || Ok(20)).unwrap();
        cache.get_or_try_build(3, || Ok(30)).unwrap();
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn pinned_entries_survive_eviction() {
        let cache: LruCache<u32, u32> = LruCache::new("test", 1);
        let pinned = cache.get_or_try_build(1, || Ok(10)).unwrap();
        cache.get_or_try_build(2, || Ok(20)).unwrap();
        // Entry 1 is still referenced, so it must still be resident.
        let again = cache.get_or_try_build(1, || panic!("must hit")).unwrap();
        assert!(Arc::ptr_eq(&pinned, &again));
    }

    #[test]
    fn lut_pool_returns_identical_tables_for_identical_keys() {
        let pool = LutPool::new();
        let a = pool.forward(65535, 2.2);
        let b = pool.forward(65535, 2.2);
        assert!(Arc::ptr_eq(&a, &b));
        let c = pool.forward(65535, 1.8);
        assert!(!Arc::ptr_eq(&a, &c));

        let o1 = pool.output(255, 2.2, 0, 255);
        let o2 = pool.output(255, 2.2, 0, 255);
        assert!(Arc::ptr_eq(&o1, &o2));
    }

    #[test]
    fn output_lut_stretches_gray_range() {
        let pool = LutPool::new();
        let t = pool.output(65535, 1.0, 64, 191);
        // Values at or below gray_min clamp to zero, at or above gray_max
        // to full scale.
        assert_eq!(t[(64 * 65535) / 255], 0);
        assert_eq!(t[(191 * 65535) / 255 + 16], 65535);
    }

    #[test]
    fn screen_cache_dedups_tiles() {
        let screens = ScreenCache::new();
        let a = screens.get(ScreenType::Dufay, 0.0, StripWidths::default()).unwrap();
        let b = screens.get(ScreenType::Dufay, 0.0, StripWidths::default()).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(a.id(), b.id());
    }

    #[test]
    fn stitch_mode_triples_analyzer_capacity() {
        let caches = Caches::new();
        let base = caches.analyzers.capacity();
        caches.enter_stitch_mode();
        assert_eq!(caches.analyzers.capacity(), base * 3);
        caches.leave_stitch_mode();
        assert_eq!(caches.analyzers.capacity(), base);
    }
}
