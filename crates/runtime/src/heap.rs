//! Heap, spaces and pages.
//!
//! The heap is split into two parts:
//!
//!  * new space - all objects are allocated here
//!  * old space - tenured objects are placed here
//!
//! Both spaces are lists of allocated buffers (pages) with bump
//! allocation. A page's `top` starts at `data + 1` so every pointer
//! the allocator hands out is odd, preserving the boxed tag bit.

use std::mem;
use std::ptr;

use crate::source_map::SourceMap;

/// Machine word size; all interior offsets are multiples of this.
pub const POINTER_SIZE: usize = mem::size_of::<usize>();

/// Word planted at `[fp]` of an enter frame; the next word links to
/// the previous sentinel chain head.
pub const ENTER_FRAME_TAG: usize = 0xFEED_BEEE;

/// Marks the parent-context slot of host-call binding functions so
/// the collector does not treat it as a heap pointer.
pub const BINDING_CONTEXT_TAG: usize = 0x0DEC_0DEC;

/// Objects surviving this many evacuations are promoted to old space.
pub const MIN_OLD_SPACE_GENERATION: u8 = 5;

/// Default page size for embedders that do not care.
pub const DEFAULT_PAGE_SIZE: u32 = 128 * 1024;

/// Heap object tags. A closed set; `Nil` doubles as the immediate nil
/// value `0x1` which never points at a real header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum HeapTag {
    Nil = 0x01,
    Context,
    // Keep these close to each other (needed for typeof)
    Boolean,
    Number,
    String,
    Object,
    Array,
    Function,
    CData,
    Map,
}

impl HeapTag {
    pub fn from_u8(raw: u8) -> Option<HeapTag> {
        Some(match raw {
            0x01 => HeapTag::Nil,
            0x02 => HeapTag::Context,
            0x03 => HeapTag::Boolean,
            0x04 => HeapTag::Number,
            0x05 => HeapTag::String,
            0x06 => HeapTag::Object,
            0x07 => HeapTag::Array,
            0x08 => HeapTag::Function,
            0x09 => HeapTag::CData,
            0x0a => HeapTag::Map,
            _ => return None,
        })
    }
}

/// Which space an allocation lands in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tenure {
    New,
    Old,
}

/// The `needs_gc` word read by emitted code at safe points.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(usize)]
pub enum GcType {
    None = 0,
    NewSpace = 1,
    OldSpace = 2,
}

/// Positions in the root context.
/// NOTE: order of type strings matches the `HeapTag` order.
pub mod root {
    pub const GLOBAL_INDEX: usize = 0;
    pub const TRUE_INDEX: usize = 1;
    pub const FALSE_INDEX: usize = 2;
    pub const NIL_TYPE_INDEX: usize = 3;
    pub const BOOLEAN_TYPE_INDEX: usize = 4;
    pub const NUMBER_TYPE_INDEX: usize = 5;
    pub const STRING_TYPE_INDEX: usize = 6;
    pub const OBJECT_TYPE_INDEX: usize = 7;
    pub const ARRAY_TYPE_INDEX: usize = 8;
    pub const FUNCTION_TYPE_INDEX: usize = 9;
    pub const CDATA_TYPE_INDEX: usize = 10;
    pub const SLOT_COUNT: usize = 11;
}

/// A single page: an owned byte buffer with bump-allocation cursors.
pub struct Page {
    data: *mut u8,
    pub(crate) top: *mut u8,
    pub(crate) limit: *mut u8,
    size: u32,
}

impl Page {
    fn new(size: u32) -> Box<Page> {
        let data = unsafe { libc::malloc(size as usize) as *mut u8 };
        if data.is_null() {
            // Heap exhaustion is fatal (see error taxonomy).
            std::process::abort();
        }
        unsafe {
            ptr::write_bytes(data, 0, size as usize);
        }
        Box::new(Page {
            data,
            // Make all offsets odd (pointers are tagged with 1 at last bit)
            top: unsafe { data.add(1) },
            limit: unsafe { data.add(size as usize) },
            size,
        })
    }

    fn room_for(&self, bytes: usize) -> bool {
        (self.top as usize) + bytes <= self.limit as usize
    }
}

impl Drop for Page {
    fn drop(&mut self) {
        unsafe { libc::free(self.data as *mut libc::c_void) }
    }
}

/// An ordered sequence of pages with a current allocation cursor.
///
/// `top` and `limit` always point at the current page's cursors, so
/// emitted code reaches allocation state by double indirection
/// through a stable cell.
pub struct Space {
    pages: Vec<Box<Page>>,
    current: usize,
    top: *mut *mut u8,
    limit: *mut *mut u8,
    page_size: u32,
    size: u32,
    size_limit: u32,
}

impl Space {
    pub fn new(page_size: u32) -> Space {
        let mut space = Space {
            pages: Vec::new(),
            current: 0,
            top: ptr::null_mut(),
            limit: ptr::null_mut(),
            page_size,
            size: 0,
            size_limit: page_size << 1,
        };
        space.add_page(page_size);
        space
    }

    /// Point the allocation cells at `page`'s cursors.
    fn select(&mut self, index: usize) {
        self.current = index;
        self.top = &mut self.pages[index].top;
        self.limit = &mut self.pages[index].limit;
    }

    /// Adds an empty page of at least `size` bytes and makes it
    /// current.
    fn add_page(&mut self, size: u32) {
        let size = size.max(self.page_size);
        self.pages.push(Page::new(size));
        self.size += size;
        self.select(self.pages.len() - 1);
    }

    /// Bump allocation. `bytes` is rounded up to an even count so the
    /// post-increment `top` stays odd.
    pub fn allocate(&mut self, bytes: u32) -> *mut u8 {
        let bytes = ((bytes + 1) & !1) as usize;

        if !self.pages[self.current].room_for(bytes) {
            // Move to the next page with enough room, otherwise
            // allocate a new one.
            let next = (self.current + 1..self.pages.len()).find(|&i| self.pages[i].room_for(bytes));
            match next {
                Some(i) => self.select(i),
                None => self.add_page(bytes as u32 + 1),
            }
        }

        let page = &mut self.pages[self.current];
        let result = page.top;
        page.top = unsafe { page.top.add(bytes) };
        result
    }

    /// Address of the cell holding the current page's `top` pointer.
    pub fn top_ptr(&mut self) -> *mut *mut *mut u8 {
        &mut self.top
    }

    /// Address of the cell holding the current page's `limit`.
    pub fn limit_ptr(&mut self) -> *mut *mut *mut u8 {
        &mut self.limit
    }

    /// Takes all pages from `other`, dropping our own; `other` is
    /// left cleared. Used at the end of a GC cycle to install the
    /// to-space.
    pub fn swap(&mut self, other: &mut Space) {
        self.pages = mem::take(&mut other.pages);
        self.size = other.size;
        self.select(other.current);
        other.clear();
    }

    /// Remove all pages and start fresh.
    pub fn clear(&mut self) {
        self.pages.clear();
        self.size = 0;
        self.add_page(self.page_size);
    }

    /// True when `addr` lies inside one of this space's pages.
    pub fn contains(&self, addr: *const u8) -> bool {
        self.pages
            .iter()
            .any(|p| (p.data as usize) <= addr as usize && (addr as usize) < p.limit as usize)
    }

    pub fn page_size(&self) -> u32 {
        self.page_size
    }

    pub fn size(&self) -> u32 {
        self.size
    }

    pub fn size_limit(&self) -> u32 {
        self.size_limit
    }

    /// After a successful GC the limit is set to twice the live size.
    pub fn compute_size_limit(&mut self) {
        self.size_limit = self.size << 1;
    }
}

/// Weak callbacks fire exactly once when the referent becomes
/// unreachable.
pub type WeakCallback = fn(*mut u8);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefKind {
    Weak,
    Persistent,
}

/// A registered embedding handle; `slot` points at the cell the
/// façade hands out, rewritten when the referent moves.
pub struct ValueRef {
    pub kind: RefKind,
    pub slot: *mut *mut u8,
}

pub struct WeakRef {
    pub value: *mut u8,
    pub callback: WeakCallback,
}

/// The heap: two spaces plus the bookkeeping shared with generated
/// code and the collector. One heap per isolate; no cross-heap
/// sharing.
pub struct Heap {
    pub(crate) new_space: Space,
    pub(crate) old_space: Space,

    needs_gc: usize,

    // Support re-entering candor after invoking host code
    pub last_stack: *mut u8,
    pub last_frame: *mut u8,

    pub pending_exception: *mut u8,

    pub(crate) references: Vec<ValueRef>,
    pub(crate) weak_refs: Vec<WeakRef>,

    pub(crate) root_context: *mut u8,

    source_map: SourceMap,
    /// Byte offsets of line starts in the compiled source, for stack
    /// trace decoding.
    line_starts: Vec<u32>,
    code_ranges: Vec<(usize, usize)>,
}

impl Heap {
    pub fn new(page_size: u32) -> Box<Heap> {
        Box::new(Heap {
            new_space: Space::new(page_size),
            old_space: Space::new(page_size),
            needs_gc: GcType::None as usize,
            last_stack: ptr::null_mut(),
            last_frame: ptr::null_mut(),
            pending_exception: ptr::null_mut(),
            references: Vec::new(),
            weak_refs: Vec::new(),
            root_context: ptr::null_mut(),
            source_map: SourceMap::new(),
            line_starts: Vec::new(),
            code_ranges: Vec::new(),
        })
    }

    pub fn new_space(&self) -> &Space {
        &self.new_space
    }

    pub fn old_space(&self) -> &Space {
        &self.old_space
    }

    pub fn space_mut(&mut self, tenure: Tenure) -> &mut Space {
        match tenure {
            Tenure::New => &mut self.new_space,
            Tenure::Old => &mut self.old_space,
        }
    }

    /// Allocate `bytes` of raw tagged storage and stamp the header:
    /// tag byte set, representation/generation/mark cleared.
    pub fn allocate_tagged(&mut self, tag: HeapTag, tenure: Tenure, bytes: u32) -> *mut u8 {
        let space = self.space_mut(tenure);
        let addr = space.allocate(bytes);
        unsafe {
            // Clear the header word and the forwarding word.
            ptr::write_bytes(addr.sub(1), 0, (2 * POINTER_SIZE).min(bytes as usize));
            *addr.sub(1) = tag as u8;
            if tenure == Tenure::Old {
                // Directly-tenured objects must not be demoted by the
                // next evacuation.
                *addr.add(1) = MIN_OLD_SPACE_GENERATION;
            }
        }
        if self.new_space.size() > self.new_space.size_limit() {
            self.request_gc(GcType::NewSpace);
        } else if self.old_space.size() > self.old_space.size_limit() {
            self.request_gc(GcType::OldSpace);
        }
        addr
    }

    pub fn needs_gc(&self) -> GcType {
        match self.needs_gc {
            1 => GcType::NewSpace,
            2 => GcType::OldSpace,
            _ => GcType::None,
        }
    }

    pub fn request_gc(&mut self, ty: GcType) {
        self.needs_gc = ty as usize;
    }

    pub fn clear_needs_gc(&mut self) {
        self.needs_gc = GcType::None as usize;
    }

    /// Address of the `needs_gc` word, read by emitted code at safe
    /// points.
    pub fn needs_gc_addr(&mut self) -> *mut usize {
        &mut self.needs_gc
    }

    /// Address of the new-space `top` cell; the inline allocation
    /// path dereferences it twice.
    pub fn new_space_top_addr(&mut self) -> *mut *mut *mut u8 {
        self.new_space.top_ptr()
    }

    pub fn new_space_limit_addr(&mut self) -> *mut *mut *mut u8 {
        self.new_space.limit_ptr()
    }

    /// Address of the sentinel chain head, maintained by enter
    /// frames.
    pub fn last_frame_addr(&mut self) -> *mut *mut u8 {
        &mut self.last_frame
    }

    /// Address of the saved stack top, published around host
    /// callbacks so re-entry can resume the chain.
    pub fn last_stack_addr(&mut self) -> *mut *mut u8 {
        &mut self.last_stack
    }

    pub fn root_context(&self) -> *mut u8 {
        self.root_context
    }

    pub fn set_root_context(&mut self, context: *mut u8) {
        self.root_context = context;
    }

    // Referencing embedder handles

    pub fn reference(&mut self, kind: RefKind, slot: *mut *mut u8) {
        self.references.push(ValueRef { kind, slot });
    }

    pub fn dereference(&mut self, slot: *mut *mut u8) {
        self.references.retain(|r| r.slot != slot);
    }

    pub fn make_weak_ref(&mut self, slot: *mut *mut u8) {
        for r in &mut self.references {
            if r.slot == slot {
                r.kind = RefKind::Weak;
            }
        }
    }

    // Weakening embedder values

    pub fn add_weak(&mut self, value: *mut u8, callback: WeakCallback) {
        self.weak_refs.push(WeakRef { value, callback });
    }

    pub fn remove_weak(&mut self, value: *mut u8) {
        self.weak_refs.retain(|w| w.value != value);
    }

    // Code ranges, used to recognize return addresses during the
    // stack walk.

    pub fn register_code_range(&mut self, start: usize, len: usize) {
        self.code_ranges.push((start, start + len));
    }

    pub fn is_code_addr(&self, addr: *const u8) -> bool {
        let addr = addr as usize;
        self.code_ranges.iter().any(|&(lo, hi)| lo <= addr && addr < hi)
    }

    /// Offset of `addr` inside its registered code range, for source
    /// map lookups.
    pub fn code_range_offset(&self, addr: usize) -> Option<u32> {
        self.code_ranges
            .iter()
            .find(|&&(lo, hi)| lo <= addr && addr < hi)
            .map(|&(lo, _)| (addr - lo) as u32)
    }

    pub fn source_map(&self) -> &SourceMap {
        &self.source_map
    }

    pub fn source_map_mut(&mut self) -> &mut SourceMap {
        &mut self.source_map
    }

    /// Record line starts for `source` so stack traces can map AST
    /// offsets to line numbers.
    pub fn set_source_lines(&mut self, source: &str) {
        self.line_starts.clear();
        self.line_starts.push(0);
        for (i, b) in source.bytes().enumerate() {
            if b == b'\n' {
                self.line_starts.push(i as u32 + 1);
            }
        }
    }

    /// 1-based line number for a byte offset.
    pub fn line_for_offset(&self, offset: u32) -> u32 {
        match self.line_starts.binary_search(&offset) {
            Ok(i) => i as u32 + 1,
            Err(i) => i as u32,
        }
    }
}
