//! Object headers and type descriptors.
//!
//! Every managed object starts with an [`ObjHeader`]: a pointer to its
//! [`TypeInfo`], one CAS-settable mark bit, and a side pointer to optional
//! [`ExtraObjectData`]. Reference arrays carry an element count between the
//! header and the payload. Reference fields inside payloads are
//! `AtomicPtr<ObjHeader>` slots at the byte offsets listed by the type.

use std::alloc::Layout;
use std::fmt;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, AtomicPtr, Ordering};
use std::sync::Arc;

use crate::heap::extra_object::ExtraObjectData;

/// Reference slots are pointer-sized and pointer-aligned.
pub const REF_SIZE: usize = std::mem::size_of::<usize>();
pub const REF_ALIGN: usize = std::mem::align_of::<usize>();

/// A finalization callback, invoked on the finalizer thread after the object
/// has been found dead. It must not dereference the object's reference
/// fields: the referents may already have been reclaimed in the same epoch.
pub type Finalizer = Arc<dyn Fn(ObjRef) + Send + Sync>;

/// Static description of a managed type: payload size, where its reference
/// fields live, and an optional finalizer. The runtime's type system owns
/// these; the collector only reads them.
pub struct TypeInfo {
    pub name: &'static str,
    /// Payload size in bytes, excluding the header. Ignored for reference
    /// arrays, whose size is determined per-instance by the element count.
    pub payload_size: usize,
    /// Byte offsets of reference slots within the payload. Each must be
    /// aligned to [`REF_ALIGN`].
    pub ref_offsets: &'static [usize],
    /// If true, the payload is a contiguous run of reference slots and the
    /// instance carries its own element count.
    pub is_ref_array: bool,
    pub finalizer: Option<Finalizer>,
}

impl TypeInfo {
    pub fn object(name: &'static str, payload_size: usize, ref_offsets: &'static [usize]) -> Self {
        debug_assert!(ref_offsets
            .iter()
            .all(|o| o % REF_ALIGN == 0 && o + REF_SIZE <= payload_size));
        Self {
            name,
            payload_size,
            ref_offsets,
            is_ref_array: false,
            finalizer: None,
        }
    }

    pub fn ref_array(name: &'static str) -> Self {
        Self {
            name,
            payload_size: 0,
            ref_offsets: &[],
            is_ref_array: true,
            finalizer: None,
        }
    }

    pub fn with_finalizer(mut self, finalizer: Finalizer) -> Self {
        self.finalizer = Some(finalizer);
        self
    }

    /// Intern a type descriptor for the lifetime of the process. Tests and
    /// simple embedders use this; real runtimes keep their own type tables.
    pub fn leak(self) -> &'static TypeInfo {
        Box::leak(Box::new(self))
    }
}

impl fmt::Debug for TypeInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TypeInfo")
            .field("name", &self.name)
            .field("payload_size", &self.payload_size)
            .field("is_ref_array", &self.is_ref_array)
            .finish()
    }
}

/// The header at the start of every managed allocation.
#[repr(C)]
pub struct ObjHeader {
    type_info: &'static TypeInfo,
    mark: AtomicBool,
    extra: AtomicPtr<ExtraObjectData>,
}

/// Header of a reference array: the common header plus the element count.
#[repr(C)]
pub struct ArrayHeader {
    /// Accessed through the `ObjHeader` view of the allocation.
    #[allow(dead_code)]
    object: ObjHeader,
    len: u32,
}

const fn round_up(n: usize, align: usize) -> usize {
    (n + align - 1) & !(align - 1)
}

const OBJECT_PAYLOAD_OFFSET: usize = round_up(std::mem::size_of::<ObjHeader>(), REF_ALIGN);
const ARRAY_PAYLOAD_OFFSET: usize = round_up(std::mem::size_of::<ArrayHeader>(), REF_ALIGN);

fn object_layout(type_info: &TypeInfo) -> Layout {
    Layout::from_size_align(OBJECT_PAYLOAD_OFFSET + type_info.payload_size, REF_ALIGN).unwrap()
}

fn array_layout(len: u32) -> Layout {
    Layout::from_size_align(ARRAY_PAYLOAD_OFFSET + len as usize * REF_SIZE, REF_ALIGN).unwrap()
}

/// A reference to a live managed object. `Copy`; validity is the caller's
/// (i.e. the collector's) concern, which is why the constructors are unsafe.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObjRef(NonNull<ObjHeader>);

// Object references travel between mutators, mark workers and the finalizer
// thread; all mutable state behind them is atomic.
unsafe impl Send for ObjRef {}
unsafe impl Sync for ObjRef {}

impl ObjRef {
    /// # Safety
    /// `ptr` must point to a live allocation created by [`ObjRef::alloc_object`]
    /// or [`ObjRef::alloc_array`].
    pub unsafe fn from_raw(ptr: *mut ObjHeader) -> Option<ObjRef> {
        NonNull::new(ptr).map(ObjRef)
    }

    pub fn as_ptr(self) -> *mut ObjHeader {
        self.0.as_ptr()
    }

    fn header(&self) -> &ObjHeader {
        unsafe { self.0.as_ref() }
    }

    /// Allocate a new object of `type_info` with all reference slots null
    /// and the mark bit clear.
    pub(crate) fn alloc_object(type_info: &'static TypeInfo) -> ObjRef {
        debug_assert!(!type_info.is_ref_array);
        let layout = object_layout(type_info);
        unsafe {
            let mem = std::alloc::alloc_zeroed(layout) as *mut ObjHeader;
            if mem.is_null() {
                std::alloc::handle_alloc_error(layout);
            }
            mem.write(ObjHeader {
                type_info,
                mark: AtomicBool::new(false),
                extra: AtomicPtr::new(std::ptr::null_mut()),
            });
            ObjRef(NonNull::new_unchecked(mem))
        }
    }

    /// Allocate a reference array of `len` null elements.
    pub(crate) fn alloc_array(type_info: &'static TypeInfo, len: u32) -> ObjRef {
        debug_assert!(type_info.is_ref_array);
        let layout = array_layout(len);
        unsafe {
            let mem = std::alloc::alloc_zeroed(layout) as *mut ArrayHeader;
            if mem.is_null() {
                std::alloc::handle_alloc_error(layout);
            }
            mem.write(ArrayHeader {
                object: ObjHeader {
                    type_info,
                    mark: AtomicBool::new(false),
                    extra: AtomicPtr::new(std::ptr::null_mut()),
                },
                len,
            });
            ObjRef(NonNull::new_unchecked(mem as *mut ObjHeader))
        }
    }

    /// Release the object's storage. Extra data is owned by the extra-object
    /// factory and must have been detached by its own sweep first.
    ///
    /// # Safety
    /// The object must be unreachable and must not be referenced by any
    /// queue, root or field afterwards.
    pub(crate) unsafe fn dealloc(self) {
        debug_assert!(
            self.extra_data().is_null(),
            "extra data must be detached before the object is reclaimed"
        );
        let layout = self.alloc_layout();
        std::alloc::dealloc(self.as_ptr() as *mut u8, layout);
    }

    fn alloc_layout(&self) -> Layout {
        let type_info = self.type_info();
        if type_info.is_ref_array {
            array_layout(self.array_len())
        } else {
            object_layout(type_info)
        }
    }

    pub fn type_info(&self) -> &'static TypeInfo {
        self.header().type_info
    }

    pub fn is_ref_array(&self) -> bool {
        self.type_info().is_ref_array
    }

    pub fn array_len(&self) -> u32 {
        debug_assert!(self.is_ref_array());
        unsafe { (*(self.as_ptr() as *const ArrayHeader)).len }
    }

    /// Total heap footprint of this allocation, header included.
    pub fn heap_size(&self) -> usize {
        self.alloc_layout().size()
    }

    /// Set the mark bit. Returns true iff it was previously clear, i.e. the
    /// caller is the unique marker of this object for the current epoch.
    pub fn try_mark(&self) -> bool {
        self.header()
            .mark
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Clear the mark bit. Returns true iff the object was marked, which the
    /// sweep uses as its liveness query.
    pub fn try_reset_mark(&self) -> bool {
        self.header().mark.swap(false, Ordering::AcqRel)
    }

    pub fn is_marked(&self) -> bool {
        self.header().mark.load(Ordering::Acquire)
    }

    pub(crate) fn extra_data(&self) -> *mut ExtraObjectData {
        self.header().extra.load(Ordering::Acquire)
    }

    pub(crate) fn set_extra_data(&self, extra: *mut ExtraObjectData) {
        let prev = self.header().extra.swap(extra, Ordering::AcqRel);
        debug_assert!(prev.is_null(), "object already has extra data attached");
    }

    pub(crate) fn clear_extra_data(&self) -> *mut ExtraObjectData {
        self.header().extra.swap(std::ptr::null_mut(), Ordering::AcqRel)
    }

    pub fn has_finalizer(&self) -> bool {
        self.type_info().finalizer.is_some()
    }

    fn payload(&self) -> *mut u8 {
        let offset = if self.is_ref_array() {
            ARRAY_PAYLOAD_OFFSET
        } else {
            OBJECT_PAYLOAD_OFFSET
        };
        unsafe { (self.as_ptr() as *mut u8).add(offset) }
    }

    /// The reference slot at `offset` bytes into the payload.
    fn ref_slot(&self, offset: usize) -> &AtomicPtr<ObjHeader> {
        debug_assert!(
            self.is_ref_array() || self.type_info().ref_offsets.contains(&offset),
            "offset {} is not a reference slot of {}",
            offset,
            self.type_info().name
        );
        unsafe { &*(self.payload().add(offset) as *const AtomicPtr<ObjHeader>) }
    }

    pub fn load_field(&self, offset: usize) -> Option<ObjRef> {
        let ptr = self.ref_slot(offset).load(Ordering::Acquire);
        unsafe { ObjRef::from_raw(ptr) }
    }

    pub fn store_field(&self, offset: usize, value: Option<ObjRef>) {
        let ptr = value.map_or(std::ptr::null_mut(), ObjRef::as_ptr);
        self.ref_slot(offset).store(ptr, Ordering::Release);
    }

    pub fn load_element(&self, index: u32) -> Option<ObjRef> {
        debug_assert!(index < self.array_len());
        self.load_field(index as usize * REF_SIZE)
    }

    pub fn store_element(&self, index: u32, value: Option<ObjRef>) {
        debug_assert!(index < self.array_len());
        self.store_field(index as usize * REF_SIZE, value)
    }

    /// Visit every reference slot of this object. Used by the marker.
    pub(crate) fn each_ref_slot<F>(&self, mut f: F)
    where
        F: FnMut(&AtomicPtr<ObjHeader>),
    {
        if self.is_ref_array() {
            for i in 0..self.array_len() {
                f(self.ref_slot(i as usize * REF_SIZE));
            }
        } else {
            for &offset in self.type_info().ref_offsets {
                f(self.ref_slot(offset));
            }
        }
    }
}

impl fmt::Debug for ObjRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{:p}", self.type_info().name, self.as_ptr())
    }
}
