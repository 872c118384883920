//! Heap memory and object allocation
//!
//! ## Design
//!
//! - **Memory**: one word-addressed arena of atomics split into young,
//!   tenured and template spaces laid out back to back from [`HEAP_BASE`],
//!   so address 0 is never an object.
//! - **Young**: bump allocation, reset wholesale after a young collection.
//! - **Tenured**: fixed-size pools with bump allocation and a first-fit
//!   free list whose adjacent blocks are merged on free; a pool whose last object dies is released and handed back
//!   through [`ObjectAllocator::visit_and_remove_free_pools`].
//! - **Template**: bump-only space filled once before fork, never swept.

use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::class::ClassId;
use crate::fatal;
use crate::mem_range::{Address, MemRange};
use crate::object::{
    CLASS_WORD_OFFSET, HEADER_WORDS, MARK_WORD_OFFSET, MarkWord, ObjectRef, ObjectState,
    ObjectStatus, TaggedValue, WORD_SIZE,
};
use crate::settings::GcSettings;

/// First heap address
pub const HEAP_BASE: Address = 0x1_0000;

/// Smallest object: a bare header
pub const MIN_OBJECT_SIZE: usize = HEADER_WORDS * WORD_SIZE;

/// Spare pools demanded on top of a full young space before promoting
const PROMOTION_RESERVE_POOLS: usize = 1;

/// Heap space kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpaceKind {
    /// Nursery
    Young,
    /// Mark-swept pools
    Tenured,
    /// Pre-fork template space
    Template,
}

/// Lifecycle of the template space
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TemplateSpaceState {
    /// Nothing moved yet
    Init,
    /// Fork collection in progress
    Forking,
    /// Objects moved; space frozen
    Forked,
}

/// Contiguous block of heap words
struct Space {
    range: MemRange,
    words: Box<[AtomicUsize]>,
}

impl Space {
    fn new(start: Address, size: usize) -> Self {
        Self {
            range: MemRange::with_size(start, size),
            words: (0..size / WORD_SIZE).map(|_| AtomicUsize::new(0)).collect(),
        }
    }

    #[inline]
    fn slot(&self, addr: Address) -> &AtomicUsize {
        &self.words[(addr - self.range.start()) / WORD_SIZE]
    }
}

/// Backing memory of all spaces
pub struct HeapMemory {
    young: Space,
    tenured: Space,
    template: Space,
}

impl HeapMemory {
    /// Lay out spaces of the given byte sizes from [`HEAP_BASE`]
    pub fn new(young_size: usize, tenured_size: usize, template_size: usize) -> Self {
        let young = Space::new(HEAP_BASE, young_size);
        let tenured = Space::new(young.range.end(), tenured_size);
        let template = Space::new(tenured.range.end(), template_size);
        Self {
            young,
            tenured,
            template,
        }
    }

    /// Whole heap
    pub fn range(&self) -> MemRange {
        MemRange::new(self.young.range.start(), self.template.range.end())
    }

    /// Young space
    pub fn young_range(&self) -> MemRange {
        self.young.range
    }

    /// Tenured space
    pub fn tenured_range(&self) -> MemRange {
        self.tenured.range
    }

    /// Template space
    pub fn template_range(&self) -> MemRange {
        self.template.range
    }

    /// Check if an address lies in the young space
    #[inline]
    pub fn is_young(&self, addr: Address) -> bool {
        self.young.range.contains_address(addr)
    }

    /// Space holding `addr`
    pub fn space_kind(&self, addr: Address) -> Option<SpaceKind> {
        if self.young.range.contains_address(addr) {
            Some(SpaceKind::Young)
        } else if self.tenured.range.contains_address(addr) {
            Some(SpaceKind::Tenured)
        } else if self.template.range.contains_address(addr) {
            Some(SpaceKind::Template)
        } else {
            None
        }
    }

    #[inline]
    fn slot(&self, addr: Address) -> &AtomicUsize {
        if addr % WORD_SIZE != 0 {
            fatal!("unaligned heap access at {:#x}", addr);
        }
        match self.space_kind(addr) {
            Some(SpaceKind::Young) => self.young.slot(addr),
            Some(SpaceKind::Tenured) => self.tenured.slot(addr),
            Some(SpaceKind::Template) => self.template.slot(addr),
            None => fatal!("heap access outside the heap at {:#x}", addr),
        }
    }

    /// Load a word
    #[inline]
    pub fn load(&self, addr: Address, order: Ordering) -> usize {
        self.slot(addr).load(order)
    }

    /// Store a word
    #[inline]
    pub fn store(&self, addr: Address, value: usize, order: Ordering) {
        self.slot(addr).store(value, order)
    }

    /// Compare-and-swap a word
    #[inline]
    pub fn compare_exchange(
        &self,
        addr: Address,
        current: usize,
        new: usize,
    ) -> Result<usize, usize> {
        self.slot(addr)
            .compare_exchange(current, new, Ordering::AcqRel, Ordering::Acquire)
    }

    /// Atomically OR bits into a word, returning the previous value
    #[inline]
    pub fn fetch_or(&self, addr: Address, bits: usize) -> usize {
        self.slot(addr).fetch_or(bits, Ordering::AcqRel)
    }

    /// Atomically clear bits in a word, returning the previous value
    #[inline]
    pub fn fetch_and(&self, addr: Address, bits: usize) -> usize {
        self.slot(addr).fetch_and(bits, Ordering::AcqRel)
    }

    /// Zero `words` words from `addr`
    pub fn fill_zero(&self, addr: Address, words: usize) {
        for i in 0..words {
            self.store(addr + i * WORD_SIZE, 0, Ordering::Relaxed);
        }
    }

    /// Copy `words` words from `src` to `dst`
    pub fn copy_words(&self, src: Address, dst: Address, words: usize) {
        for i in 0..words {
            let value = self.load(src + i * WORD_SIZE, Ordering::Relaxed);
            self.store(dst + i * WORD_SIZE, value, Ordering::Relaxed);
        }
    }

    /// Mark word of `obj`
    #[inline]
    pub fn mark_word(&self, obj: ObjectRef) -> MarkWord {
        MarkWord::from_raw(self.load(obj.field_addr(MARK_WORD_OFFSET), Ordering::Acquire))
    }

    /// Overwrite the mark word of `obj`
    #[inline]
    pub fn set_mark_word(&self, obj: ObjectRef, mw: MarkWord) {
        self.store(obj.field_addr(MARK_WORD_OFFSET), mw.raw(), Ordering::Release)
    }

    /// Class id of `obj`
    #[inline]
    pub fn class_id(&self, obj: ObjectRef) -> ClassId {
        ClassId(self.load(obj.field_addr(CLASS_WORD_OFFSET), Ordering::Acquire) as u32)
    }

    /// Install the header of a freshly allocated object
    pub fn init_header(&self, obj: ObjectRef, class: ClassId) {
        self.store(obj.field_addr(MARK_WORD_OFFSET), 0, Ordering::Relaxed);
        self.store(obj.field_addr(CLASS_WORD_OFFSET), class.0 as usize, Ordering::Release);
    }

    /// Raw body word
    #[inline]
    pub fn read_word(&self, obj: ObjectRef, offset: usize) -> usize {
        self.load(obj.field_addr(offset), Ordering::Acquire)
    }

    /// Store a raw body word without any barrier
    #[inline]
    pub fn write_word(&self, obj: ObjectRef, offset: usize, value: usize) {
        self.store(obj.field_addr(offset), value, Ordering::Release)
    }

    /// Reference field
    #[inline]
    pub fn read_ref(&self, obj: ObjectRef, offset: usize) -> Option<ObjectRef> {
        ObjectRef::from_address(self.read_word(obj, offset))
    }

    /// Tagged slot
    #[inline]
    pub fn read_tagged(&self, obj: ObjectRef, offset: usize) -> TaggedValue {
        TaggedValue::from_raw(self.read_word(obj, offset))
    }

    /// Forwarded copy of `obj`, if it has been moved
    #[inline]
    pub fn forwardee(&self, obj: ObjectRef) -> Option<ObjectRef> {
        let mw = self.mark_word(obj);
        match mw.state() {
            ObjectState::Forwarded => ObjectRef::from_address(mw.forwarding_address()),
            ObjectState::Normal => None,
        }
    }
}

/// Objects and bytes released by a sweep
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FreedStats {
    /// Objects released
    pub objects: usize,
    /// Bytes released
    pub bytes: usize,
}

/// Allocator interface consumed by the collectors
pub trait ObjectAllocator: Send + Sync {
    /// Backing memory
    fn memory(&self) -> &HeapMemory;

    /// Allocate `size` bytes (word aligned) in the young space when it
    /// fits there, otherwise in tenured. Memory comes back zeroed.
    fn alloc(&self, size: usize) -> Option<ObjectRef>;

    /// Allocate `size` bytes in tenured
    fn alloc_tenured(&self, size: usize) -> Option<ObjectRef>;

    /// Allocate `size` bytes in the template space
    fn alloc_template(&self, size: usize) -> Option<ObjectRef>;

    /// Visit every object in every space
    fn iterate_over_objects(&self, visitor: &mut dyn FnMut(ObjectRef)) {
        self.iterate_over_young_objects(visitor);
        self.iterate_over_tenured_objects(visitor);
        self.iterate_over_template_objects(visitor);
    }

    /// Visit young objects
    fn iterate_over_young_objects(&self, visitor: &mut dyn FnMut(ObjectRef));

    /// Visit tenured objects
    fn iterate_over_tenured_objects(&self, visitor: &mut dyn FnMut(ObjectRef));

    /// Visit template-space objects
    fn iterate_over_template_objects(&self, visitor: &mut dyn FnMut(ObjectRef));

    /// Visit objects overlapping `range`
    fn iterate_over_objects_in_range(&self, range: MemRange, visitor: &mut dyn FnMut(ObjectRef));

    /// Sweep tenured: release every object the checker reports dead
    fn collect(&self, checker: &mut dyn FnMut(ObjectRef) -> ObjectStatus) -> FreedStats;

    /// Release specific tenured objects
    fn free_objects(&self, objects: &[ObjectRef]) -> FreedStats;

    /// Hand out and forget pools emptied by sweeping
    fn visit_and_remove_free_pools(&self, visitor: &mut dyn FnMut(MemRange));

    /// Young space ranges (empty without a young space)
    fn young_space_mem_ranges(&self) -> Vec<MemRange>;

    /// Check if `addr` lies in the young space
    fn is_address_in_young_space(&self, addr: Address) -> bool {
        self.memory().is_young(addr)
    }

    /// Check if at least `pools` unused pools remain in tenured
    fn have_enough_pools_in_object_space(&self, pools: usize) -> bool;

    /// Free pools that must remain for a full young space to be promoted
    fn pools_for_young_promotion(&self) -> usize;

    /// Forget every young object and rewind the nursery
    fn reset_young_allocator(&self);

    /// Size in bytes of a live object, if `obj` starts one
    fn object_size(&self, obj: ObjectRef) -> Option<usize>;

    /// Check if `addr` is the start of an allocated object
    fn contains_object(&self, addr: Address) -> bool {
        ObjectRef::from_address(addr).is_some_and(|obj| self.object_size(obj).is_some())
    }

    /// Bytes allocated in the young space
    fn young_used(&self) -> usize;

    /// Bytes held by tenured objects
    fn tenured_used(&self) -> usize;

    /// Bytes held by template objects
    fn template_used(&self) -> usize;

    /// Total bytes in use
    fn footprint(&self) -> usize {
        self.young_used() + self.tenured_used() + self.template_used()
    }

    /// Template space lifecycle
    fn template_state(&self) -> TemplateSpaceState;

    /// Advance the template space lifecycle
    fn set_template_state(&self, state: TemplateSpaceState);

    /// Stop template allocation for good
    fn disable_template_alloc(&self);

    /// Check if template allocation is still possible
    fn is_template_alloc_enabled(&self) -> bool;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PoolState {
    Free,
    InUse,
    Released,
}

struct Pool {
    range: MemRange,
    state: PoolState,
    top: Address,
    live_bytes: usize,
    /// Free blocks below `top` keyed by address; neighbours are always merged
    free_list: BTreeMap<Address, usize>,
}

impl Pool {
    fn reset(&mut self, state: PoolState) {
        self.state = state;
        self.top = self.range.start();
        self.live_bytes = 0;
        self.free_list.clear();
    }

    fn try_alloc(&mut self, size: usize) -> Option<Address> {
        let fit = self
            .free_list
            .iter()
            .find(|&(_, &len)| len >= size)
            .map(|(&addr, &len)| (addr, len));
        if let Some((addr, len)) = fit {
            self.free_list.remove(&addr);
            // sub-object tails stay listed so a later free can absorb them
            if len > size {
                self.free_list.insert(addr + size, len - size);
            }
            return Some(addr);
        }
        if self.top + size <= self.range.end() {
            let addr = self.top;
            self.top += size;
            return Some(addr);
        }
        None
    }

    fn release_block(&mut self, mut addr: Address, mut size: usize) {
        if let Some((&prev, &prev_len)) = self.free_list.range(..addr).next_back() {
            if prev + prev_len == addr {
                self.free_list.remove(&prev);
                addr = prev;
                size += prev_len;
            }
        }
        if let Some(next_len) = self.free_list.remove(&(addr + size)) {
            size += next_len;
        }
        if addr + size == self.top {
            self.top = addr;
        } else {
            self.free_list.insert(addr, size);
        }
    }
}

struct YoungState {
    top: Address,
    objects: Vec<(Address, usize)>,
}

struct TenuredState {
    pools: Vec<Pool>,
    objects: BTreeMap<Address, usize>,
    used: usize,
}

impl TenuredState {
    fn pool_index(&self, addr: Address, pool_size: usize) -> usize {
        (addr - self.pools[0].range.start()) / pool_size
    }

    fn free(&mut self, addr: Address, pool_size: usize) -> Option<usize> {
        let size = self.objects.remove(&addr)?;
        self.used -= size;
        let idx = self.pool_index(addr, pool_size);
        let pool = &mut self.pools[idx];
        pool.live_bytes -= size;
        if pool.live_bytes == 0 {
            pool.reset(PoolState::Released);
        } else {
            pool.release_block(addr, size);
        }
        Some(size)
    }
}

struct TemplateStateInner {
    top: Address,
    objects: BTreeMap<Address, usize>,
    state: TemplateSpaceState,
    alloc_enabled: bool,
}

/// Reference allocator: young nursery, pooled tenured, template space
pub struct GenerationalHeap {
    memory: HeapMemory,
    pool_size: usize,
    young_alloc_max_size: usize,
    young: Mutex<YoungState>,
    tenured: Mutex<TenuredState>,
    template: Mutex<TemplateStateInner>,
}

impl GenerationalHeap {
    /// Build the heap described by `settings`; the young space exists only
    /// for the generational collector.
    pub fn new(settings: &GcSettings) -> Self {
        let young_size = if settings.has_young_space() {
            settings.young_size
        } else {
            0
        };
        let pool_count = settings.tenured_size / settings.pool_size;
        let memory = HeapMemory::new(
            young_size,
            pool_count * settings.pool_size,
            settings.template_size,
        );

        let tenured_start = memory.tenured_range().start();
        let pools = (0..pool_count)
            .map(|i| {
                let range =
                    MemRange::with_size(tenured_start + i * settings.pool_size, settings.pool_size);
                Pool {
                    range,
                    state: PoolState::Free,
                    top: range.start(),
                    live_bytes: 0,
                    free_list: BTreeMap::new(),
                }
            })
            .collect();

        Self {
            young: Mutex::new(YoungState {
                top: memory.young_range().start(),
                objects: Vec::new(),
            }),
            tenured: Mutex::new(TenuredState {
                pools,
                objects: BTreeMap::new(),
                used: 0,
            }),
            template: Mutex::new(TemplateStateInner {
                top: memory.template_range().start(),
                objects: BTreeMap::new(),
                state: TemplateSpaceState::Init,
                alloc_enabled: true,
            }),
            pool_size: settings.pool_size,
            young_alloc_max_size: settings.young_alloc_max_size,
            memory,
        }
    }

    fn alloc_young(&self, size: usize) -> Option<ObjectRef> {
        let mut young = self.young.lock();
        if young.top + size > self.memory.young_range().end() {
            return None;
        }
        let addr = young.top;
        young.top += size;
        young.objects.push((addr, size));
        self.memory.fill_zero(addr, size / WORD_SIZE);
        ObjectRef::from_address(addr)
    }

    fn check_size(size: usize) {
        if size < MIN_OBJECT_SIZE || size % WORD_SIZE != 0 {
            fatal!("invalid allocation size {}", size);
        }
    }

    fn snapshot_map(map: &BTreeMap<Address, usize>, range: MemRange) -> Vec<ObjectRef> {
        let mut out = Vec::new();
        if let Some((&addr, &size)) = map.range(..range.start()).next_back() {
            if addr + size > range.start() {
                out.extend(ObjectRef::from_address(addr));
            }
        }
        out.extend(
            map.range(range.start()..range.end())
                .filter_map(|(&addr, _)| ObjectRef::from_address(addr)),
        );
        out
    }
}

impl ObjectAllocator for GenerationalHeap {
    fn memory(&self) -> &HeapMemory {
        &self.memory
    }

    fn alloc(&self, size: usize) -> Option<ObjectRef> {
        Self::check_size(size);
        if !self.memory.young_range().is_empty() && size <= self.young_alloc_max_size {
            return self.alloc_young(size);
        }
        self.alloc_tenured(size)
    }

    fn alloc_tenured(&self, size: usize) -> Option<ObjectRef> {
        Self::check_size(size);
        if size > self.pool_size {
            return None;
        }
        let mut tenured = self.tenured.lock();
        let mut found = None;
        for (idx, pool) in tenured.pools.iter_mut().enumerate() {
            if pool.state == PoolState::InUse {
                if let Some(addr) = pool.try_alloc(size) {
                    found = Some((idx, addr));
                    break;
                }
            }
        }
        if found.is_none() {
            let idx = tenured.pools.iter().position(|p| p.state == PoolState::Free)?;
            let pool = &mut tenured.pools[idx];
            pool.reset(PoolState::InUse);
            found = pool.try_alloc(size).map(|addr| (idx, addr));
        }
        let (idx, addr) = found?;
        tenured.pools[idx].live_bytes += size;
        tenured.objects.insert(addr, size);
        tenured.used += size;
        self.memory.fill_zero(addr, size / WORD_SIZE);
        ObjectRef::from_address(addr)
    }

    fn alloc_template(&self, size: usize) -> Option<ObjectRef> {
        Self::check_size(size);
        let mut template = self.template.lock();
        if !template.alloc_enabled || template.top + size > self.memory.template_range().end() {
            return None;
        }
        let addr = template.top;
        template.top += size;
        template.objects.insert(addr, size);
        self.memory.fill_zero(addr, size / WORD_SIZE);
        ObjectRef::from_address(addr)
    }

    fn iterate_over_young_objects(&self, visitor: &mut dyn FnMut(ObjectRef)) {
        let objects: Vec<ObjectRef> = self
            .young
            .lock()
            .objects
            .iter()
            .filter_map(|&(addr, _)| ObjectRef::from_address(addr))
            .collect();
        objects.into_iter().for_each(visitor);
    }

    fn iterate_over_tenured_objects(&self, visitor: &mut dyn FnMut(ObjectRef)) {
        let objects = Self::snapshot_map(&self.tenured.lock().objects, self.memory.tenured_range());
        objects.into_iter().for_each(visitor);
    }

    fn iterate_over_template_objects(&self, visitor: &mut dyn FnMut(ObjectRef)) {
        let objects =
            Self::snapshot_map(&self.template.lock().objects, self.memory.template_range());
        objects.into_iter().for_each(visitor);
    }

    fn iterate_over_objects_in_range(&self, range: MemRange, visitor: &mut dyn FnMut(ObjectRef)) {
        let objects = match self.memory.space_kind(range.start()) {
            Some(SpaceKind::Young) => self
                .young
                .lock()
                .objects
                .iter()
                .filter(|&&(addr, size)| range.intersects(&MemRange::with_size(addr, size)))
                .filter_map(|&(addr, _)| ObjectRef::from_address(addr))
                .collect(),
            Some(SpaceKind::Tenured) => Self::snapshot_map(&self.tenured.lock().objects, range),
            Some(SpaceKind::Template) => Self::snapshot_map(&self.template.lock().objects, range),
            None => Vec::new(),
        };
        objects.into_iter().for_each(visitor);
    }

    fn collect(&self, checker: &mut dyn FnMut(ObjectRef) -> ObjectStatus) -> FreedStats {
        let mut candidates = Vec::new();
        self.iterate_over_tenured_objects(&mut |obj| candidates.push(obj));
        let dead: Vec<ObjectRef> = candidates
            .into_iter()
            .filter(|&obj| checker(obj) == ObjectStatus::Dead)
            .collect();
        self.free_objects(&dead)
    }

    fn free_objects(&self, objects: &[ObjectRef]) -> FreedStats {
        let mut tenured = self.tenured.lock();
        let mut stats = FreedStats::default();
        for obj in objects {
            if let Some(size) = tenured.free(obj.addr(), self.pool_size) {
                stats.objects += 1;
                stats.bytes += size;
            }
        }
        stats
    }

    fn visit_and_remove_free_pools(&self, visitor: &mut dyn FnMut(MemRange)) {
        let released: Vec<MemRange> = {
            let mut tenured = self.tenured.lock();
            tenured
                .pools
                .iter_mut()
                .filter(|p| p.state == PoolState::Released)
                .map(|p| {
                    p.reset(PoolState::Free);
                    p.range
                })
                .collect()
        };
        released.into_iter().for_each(visitor);
    }

    fn young_space_mem_ranges(&self) -> Vec<MemRange> {
        let young = self.memory.young_range();
        if young.is_empty() { Vec::new() } else { vec![young] }
    }

    fn have_enough_pools_in_object_space(&self, pools: usize) -> bool {
        self.tenured
            .lock()
            .pools
            .iter()
            .filter(|p| p.state == PoolState::Free)
            .count()
            >= pools
    }

    fn pools_for_young_promotion(&self) -> usize {
        // first fit can strand just under one young object at each pool tail
        let usable = self.pool_size - self.young_alloc_max_size.min(self.pool_size - WORD_SIZE);
        self.memory.young_range().size().div_ceil(usable) + PROMOTION_RESERVE_POOLS
    }

    fn reset_young_allocator(&self) {
        let mut young = self.young.lock();
        young.top = self.memory.young_range().start();
        young.objects.clear();
    }

    fn object_size(&self, obj: ObjectRef) -> Option<usize> {
        match self.memory.space_kind(obj.addr())? {
            SpaceKind::Young => {
                let young = self.young.lock();
                young
                    .objects
                    .binary_search_by_key(&obj.addr(), |&(addr, _)| addr)
                    .ok()
                    .map(|idx| young.objects[idx].1)
            }
            SpaceKind::Tenured => self.tenured.lock().objects.get(&obj.addr()).copied(),
            SpaceKind::Template => self.template.lock().objects.get(&obj.addr()).copied(),
        }
    }

    fn young_used(&self) -> usize {
        self.young.lock().top - self.memory.young_range().start()
    }

    fn tenured_used(&self) -> usize {
        self.tenured.lock().used
    }

    fn template_used(&self) -> usize {
        self.template.lock().top - self.memory.template_range().start()
    }

    fn template_state(&self) -> TemplateSpaceState {
        self.template.lock().state
    }

    fn set_template_state(&self, state: TemplateSpaceState) {
        self.template.lock().state = state;
    }

    fn disable_template_alloc(&self) {
        self.template.lock().alloc_enabled = false;
    }

    fn is_template_alloc_enabled(&self) -> bool {
        self.template.lock().alloc_enabled
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::GcType;

    fn heap() -> GenerationalHeap {
        GenerationalHeap::new(&GcSettings::small(GcType::Gen))
    }

    #[test]
    fn test_spaces_are_contiguous() {
        let heap = heap();
        let mem = heap.memory();
        assert_eq!(mem.young_range().start(), HEAP_BASE);
        assert_eq!(mem.young_range().end(), mem.tenured_range().start());
        assert_eq!(mem.tenured_range().end(), mem.template_range().start());
        assert_eq!(mem.space_kind(HEAP_BASE), Some(SpaceKind::Young));
        assert_eq!(mem.space_kind(0), None);
    }

    #[test]
    fn test_small_objects_go_young() {
        let heap = heap();
        let obj = heap.alloc(32).unwrap();
        assert!(heap.is_address_in_young_space(obj.addr()));
        assert_eq!(heap.object_size(obj), Some(32));
        assert_eq!(heap.young_used(), 32);

        let big = heap.alloc(8 * 1024).unwrap();
        assert!(!heap.is_address_in_young_space(big.addr()));
        assert_eq!(heap.tenured_used(), 8 * 1024);
    }

    #[test]
    fn test_young_exhaustion() {
        let heap = heap();
        let young = heap.memory().young_range().size();
        let mut count = 0;
        while heap.alloc(4096).is_some_and(|o| heap.is_address_in_young_space(o.addr())) {
            count += 1;
        }
        assert_eq!(count, young / 4096);

        heap.reset_young_allocator();
        assert_eq!(heap.young_used(), 0);
        assert!(heap.alloc(4096).is_some());
    }

    #[test]
    fn test_memory_is_zeroed_on_reuse() {
        let heap = heap();
        let a = heap.alloc_tenured(64).unwrap();
        let b = heap.alloc_tenured(64).unwrap();
        heap.memory().write_word(a, 3, 0xdead_beef);
        heap.free_objects(&[a]);

        let c = heap.alloc_tenured(64).unwrap();
        assert_eq!(c, a);
        assert_eq!(heap.memory().read_word(c, 3), 0);
        assert_ne!(b, c);
    }

    #[test]
    fn test_adjacent_free_blocks_merge() {
        let heap = heap();
        let a = heap.alloc_tenured(1024).unwrap();
        let b = heap.alloc_tenured(1024).unwrap();
        let keep = heap.alloc_tenured(64).unwrap();
        heap.free_objects(&[b]);
        heap.free_objects(&[a]);

        let merged = heap.alloc_tenured(2048).unwrap();
        assert_eq!(merged, a);
        assert!(merged.addr() < keep.addr());
    }

    #[test]
    fn test_free_tail_returns_to_bump_region() {
        let heap = heap();
        let _a = heap.alloc_tenured(64).unwrap();
        let b = heap.alloc_tenured(64).unwrap();
        let c = heap.alloc_tenured(64).unwrap();
        heap.free_objects(&[c]);
        heap.free_objects(&[b]);

        let next = heap.alloc_tenured(256).unwrap();
        assert_eq!(next, b);
    }

    #[test]
    fn test_small_leftover_is_reclaimed() {
        let heap = heap();
        let a = heap.alloc_tenured(24).unwrap();
        let _keep = heap.alloc_tenured(64).unwrap();
        heap.free_objects(&[a]);

        // leaves an 8 byte hole behind
        let small = heap.alloc_tenured(16).unwrap();
        assert_eq!(small, a);
        heap.free_objects(&[small]);

        assert_eq!(heap.alloc_tenured(24).unwrap(), a);
    }

    #[test]
    fn test_collect_releases_empty_pool() {
        let heap = heap();
        let objs: Vec<_> = (0..4).map(|_| heap.alloc_tenured(1024).unwrap()).collect();
        let keep = objs[0];

        let freed = heap.collect(&mut |obj| {
            if obj == keep {
                ObjectStatus::Alive
            } else {
                ObjectStatus::Dead
            }
        });
        assert_eq!(freed, FreedStats { objects: 3, bytes: 3 * 1024 });

        let mut released = Vec::new();
        heap.visit_and_remove_free_pools(&mut |range| released.push(range));
        assert!(released.is_empty());

        heap.free_objects(&[keep]);
        heap.visit_and_remove_free_pools(&mut |range| released.push(range));
        assert_eq!(released.len(), 1);
        assert!(released[0].contains_address(keep.addr()));
        assert_eq!(heap.tenured_used(), 0);
    }

    #[test]
    fn test_released_pool_not_reused_before_visit() {
        let settings = GcSettings {
            tenured_size: 128 * 1024,
            ..GcSettings::small(GcType::Gen)
        };
        let heap = GenerationalHeap::new(&settings);
        let a = heap.alloc_tenured(64 * 1024).unwrap();
        let _b = heap.alloc_tenured(64 * 1024).unwrap();
        heap.free_objects(&[a]);

        assert!(heap.alloc_tenured(64).is_none());
        heap.visit_and_remove_free_pools(&mut |_| {});
        assert!(heap.alloc_tenured(64).is_some());
    }

    #[test]
    fn test_objects_in_range_includes_overlap() {
        let heap = heap();
        let a = heap.alloc_tenured(1024).unwrap();
        let b = heap.alloc_tenured(64).unwrap();

        let mut seen = Vec::new();
        heap.iterate_over_objects_in_range(MemRange::with_size(a.addr() + 512, 512), &mut |o| {
            seen.push(o)
        });
        assert_eq!(seen, vec![a]);

        seen.clear();
        heap.iterate_over_objects_in_range(MemRange::with_size(a.addr() + 512, 1024), &mut |o| {
            seen.push(o)
        });
        assert_eq!(seen, vec![a, b]);
    }

    #[test]
    fn test_pools_accounting() {
        let heap = heap();
        let total = heap.memory().tenured_range().size() / (64 * 1024);
        assert!(heap.have_enough_pools_in_object_space(total));
        heap.alloc_tenured(64).unwrap();
        assert!(!heap.have_enough_pools_in_object_space(total));
        assert!(heap.have_enough_pools_in_object_space(total - 1));
        // 64K young, 60K usable per pool after tail waste, one spare
        assert_eq!(heap.pools_for_young_promotion(), 3);
    }

    #[test]
    fn test_promotion_reserve_covers_tail_waste() {
        let settings = GcSettings {
            young_size: 128 * 1024,
            tenured_size: 128 * 1024,
            ..GcSettings::small(GcType::Gen)
        };
        let heap = GenerationalHeap::new(&settings);
        assert_eq!(heap.pools_for_young_promotion(), 4);
        assert!(!heap.have_enough_pools_in_object_space(heap.pools_for_young_promotion()));
    }

    #[test]
    fn test_template_alloc() {
        let heap = heap();
        assert_eq!(heap.template_state(), TemplateSpaceState::Init);
        let obj = heap.alloc_template(32).unwrap();
        assert_eq!(heap.memory().space_kind(obj.addr()), Some(SpaceKind::Template));
        heap.disable_template_alloc();
        assert!(heap.alloc_template(32).is_none());
    }

    #[test]
    fn test_forwardee() {
        let heap = heap();
        let src = heap.alloc(32).unwrap();
        let dst = heap.alloc_tenured(32).unwrap();
        assert_eq!(heap.memory().forwardee(src), None);
        heap.memory().set_mark_word(src, MarkWord::forwarded_to(dst.addr()));
        assert_eq!(heap.memory().forwardee(src), Some(dst));
    }
}
