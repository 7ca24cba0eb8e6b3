//! Argument and return marshaling
//!
//! Converts managed [`Value`]s into the slot storage the call executor reads
//! argument pointers from, and reads raw return storage back into values.

use std::ffi::{c_char, c_void, CStr, CString};
use std::marker::PhantomData;
use std::ptr;

use libffi::middle::Type;

use super::error::{FfiError, FfiResult};
use super::types::{TypeDescriptor, Value};

/// Executor type for a descriptor
pub(crate) fn ffi_type(descriptor: TypeDescriptor) -> Type {
    match descriptor {
        TypeDescriptor::Void => Type::void(),
        TypeDescriptor::Int32 => Type::i32(),
        TypeDescriptor::Int64 => Type::i64(),
        TypeDescriptor::Float => Type::f32(),
        TypeDescriptor::Double => Type::f64(),
        TypeDescriptor::Pointer
        | TypeDescriptor::String
        | TypeDescriptor::Null
        | TypeDescriptor::Array(_) => Type::pointer(),
    }
}

/// Native storage for one argument
enum NativeSlot {
    I32(i32),
    I64(i64),
    F32(f32),
    F64(f64),
    Ptr(*const c_void),
}

/// Arguments packed for one call
///
/// Borrows the argument values: array slots point straight into their buffers,
/// so the values must outlive the call.
pub(crate) struct PackedArgs<'a> {
    slots: Vec<NativeSlot>,
    // Heap buffers backing string slots; moving a CString does not move its bytes.
    _strings: Vec<CString>,
    _values: PhantomData<&'a [Value]>,
}

impl<'a> PackedArgs<'a> {
    /// Pack `values` against the slot layout a stub was built for
    pub(crate) fn pack(layout: &[TypeDescriptor], values: &'a [Value]) -> FfiResult<Self> {
        if layout.len() != values.len() {
            return Err(FfiError::call_failed(format!(
                "stub expects {} arguments, got {}",
                layout.len(),
                values.len()
            )));
        }

        let mut slots = Vec::with_capacity(values.len());
        let mut strings = Vec::new();

        for (index, (expected, value)) in layout.iter().zip(values).enumerate() {
            if value.descriptor() != *expected {
                return Err(FfiError::call_failed(format!(
                    "argument {} is {}, stub expects {}",
                    index,
                    value.descriptor(),
                    expected
                )));
            }

            let slot = match value {
                Value::Int32(v) => NativeSlot::I32(*v),
                Value::Int64(v) => NativeSlot::I64(*v),
                Value::Float(v) => NativeSlot::F32(*v),
                Value::Double(v) => NativeSlot::F64(*v),
                Value::Pointer(p) => NativeSlot::Ptr(*p as *const c_void),
                Value::Null => NativeSlot::Ptr(ptr::null()),
                Value::String(s) => {
                    let owned = CString::new(s.as_str()).map_err(|_| {
                        FfiError::invalid(format!(
                            "string argument {} contains an interior NUL byte",
                            index
                        ))
                    })?;
                    let p = owned.as_ptr().cast::<c_void>();
                    strings.push(owned);
                    NativeSlot::Ptr(p)
                }
                Value::Array(array) => NativeSlot::Ptr(array.as_ptr()),
            };
            slots.push(slot);
        }

        Ok(Self {
            slots,
            _strings: strings,
            _values: PhantomData,
        })
    }

    /// Pointers to each slot, in argument order
    pub(crate) fn slot_pointers(&mut self) -> Vec<*mut c_void> {
        self.slots
            .iter_mut()
            .map(|slot| match slot {
                NativeSlot::I32(v) => (v as *mut i32).cast::<c_void>(),
                NativeSlot::I64(v) => (v as *mut i64).cast::<c_void>(),
                NativeSlot::F32(v) => (v as *mut f32).cast::<c_void>(),
                NativeSlot::F64(v) => (v as *mut f64).cast::<c_void>(),
                NativeSlot::Ptr(p) => (p as *mut *const c_void).cast::<c_void>(),
            })
            .collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.slots.len()
    }
}

/// Raw return storage
///
/// Wide enough for any supported return; integer returns narrower than a
/// register are widened to a full `ffi_arg` (pointer width) by the executor.
#[repr(C, align(16))]
pub(crate) struct ReturnSlot([u8; 16]);

impl ReturnSlot {
    pub(crate) fn new() -> Self {
        ReturnSlot([0; 16])
    }

    pub(crate) fn as_mut_ptr(&mut self) -> *mut c_void {
        self.0.as_mut_ptr().cast()
    }

    /// Read the result of a completed call
    ///
    /// # Safety
    ///
    /// The executor must have written a value of shape `ret` into this slot.
    /// For `String`, the written pointer must be null or point to a
    /// NUL-terminated buffer.
    pub(crate) unsafe fn read(&self, ret: TypeDescriptor) -> FfiResult<Option<Value>> {
        let base = self.0.as_ptr();
        let value = match ret {
            TypeDescriptor::Void => return Ok(None),
            TypeDescriptor::Int32 => Value::Int32(ptr::read(base.cast::<usize>()) as i32),
            TypeDescriptor::Int64 => Value::Int64(ptr::read(base.cast::<i64>())),
            TypeDescriptor::Float => Value::Float(ptr::read(base.cast::<f32>())),
            TypeDescriptor::Double => Value::Double(ptr::read(base.cast::<f64>())),
            TypeDescriptor::Pointer => Value::Pointer(ptr::read(base.cast::<usize>())),
            TypeDescriptor::String => {
                let p = ptr::read(base.cast::<*const c_char>());
                if p.is_null() {
                    Value::Null
                } else {
                    Value::String(CStr::from_ptr(p).to_string_lossy().into_owned())
                }
            }
            TypeDescriptor::Null | TypeDescriptor::Array(_) => {
                return Err(FfiError::invalid(format!("{} is not a return type", ret)))
            }
        };
        Ok(Some(value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ffi::ErrorKind;

    #[test]
    fn test_pack_rejects_wrong_arity() {
        let values = [Value::Int32(1)];
        let err = PackedArgs::pack(&[TypeDescriptor::Int32, TypeDescriptor::Int32], &values)
            .err()
            .expect("arity mismatch should fail");
        assert_eq!(err.kind(), ErrorKind::NativeCallFailed);
    }

    #[test]
    fn test_pack_rejects_wrong_descriptor() {
        let values = [Value::Double(1.0)];
        let err = PackedArgs::pack(&[TypeDescriptor::Int32], &values)
            .err()
            .expect("descriptor mismatch should fail");
        assert!(err.to_string().contains("argument 0 is f64"));
    }

    #[test]
    fn test_pack_rejects_interior_nul() {
        let values = [Value::from("a\0b")];
        let err = PackedArgs::pack(&[TypeDescriptor::String], &values)
            .err()
            .expect("interior NUL should fail");
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
    }

    #[test]
    fn test_slot_pointers_read_back() {
        let values = [
            Value::Int32(-7),
            Value::Double(2.5),
            Value::Null,
            Value::from(vec![1i32, 2, 3]),
        ];
        let layout: Vec<_> = values.iter().map(Value::descriptor).collect();
        let mut packed = PackedArgs::pack(&layout, &values).unwrap();
        let ptrs = packed.slot_pointers();
        assert_eq!(ptrs.len(), packed.len());

        unsafe {
            assert_eq!(*(ptrs[0] as *const i32), -7);
            assert_eq!(*(ptrs[1] as *const f64), 2.5);
            assert!((*(ptrs[2] as *const *const c_void)).is_null());
            let array = *(ptrs[3] as *const *const i32);
            assert_eq!(*array.add(2), 3);
        }
    }

    #[test]
    fn test_string_slot_is_nul_terminated() {
        let values = [Value::from("hello")];
        let mut packed = PackedArgs::pack(&[TypeDescriptor::String], &values).unwrap();
        let ptrs = packed.slot_pointers();
        let text = unsafe { CStr::from_ptr(*(ptrs[0] as *const *const c_char)) };
        assert_eq!(text.to_str().unwrap(), "hello");
    }

    #[test]
    fn test_read_void_is_absent() {
        let slot = ReturnSlot::new();
        assert_eq!(unsafe { slot.read(TypeDescriptor::Void) }.unwrap(), None);
    }

    #[test]
    fn test_read_null_string_return() {
        let slot = ReturnSlot::new();
        assert_eq!(
            unsafe { slot.read(TypeDescriptor::String) }.unwrap(),
            Some(Value::Null)
        );
    }

    #[test]
    fn test_read_double() {
        let mut slot = ReturnSlot::new();
        unsafe { ptr::write(slot.as_mut_ptr().cast::<f64>(), 12.6) };
        assert_eq!(
            unsafe { slot.read(TypeDescriptor::Double) }.unwrap(),
            Some(Value::Double(12.6))
        );
    }
}
