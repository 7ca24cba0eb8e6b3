//! Invocation Stubs
//!
//! A stub is the prepared call interface for one [`SignatureKey`]. It is
//! built once, never mutated, and reused for every function sharing the shape.

use std::fmt;

use libffi::middle::{Cif, CodePtr};
use libffi::raw;
use tracing::trace;

use super::error::{FfiError, FfiResult};
use super::loader::SymbolAddress;
use super::marshal::{ffi_type, PackedArgs, ReturnSlot};
use super::signature::SignatureKey;
use super::types::{CallingConvention, Value};

/// Prepared executor layout
struct CallInterface(Cif);

// SAFETY: the cif and the type descriptors it owns are written only during
// construction; `ffi_call` reads them and keeps no per-call state in them.
unsafe impl Send for CallInterface {}
unsafe impl Sync for CallInterface {}

/// Reusable call adapter bound to one call shape
pub struct InvocationStub {
    key: SignatureKey,
    interface: CallInterface,
}

impl InvocationStub {
    /// Build the executor layout for `key`
    ///
    /// With `strict_conventions`, a convention the target has no distinct ABI
    /// for is rejected instead of falling back to the default C ABI.
    pub(crate) fn build(key: SignatureKey, strict_conventions: bool) -> FfiResult<Self> {
        if !key.return_type().is_valid_return() {
            return Err(FfiError::invalid(format!(
                "{} is not a return type",
                key.return_type()
            )));
        }

        let abi = match (abi_for(key.convention()), strict_conventions) {
            (Some(abi), _) => abi,
            (None, false) => raw::ffi_abi_FFI_DEFAULT_ABI,
            (None, true) => {
                return Err(FfiError::call_failed(format!(
                    "{} is not supported on this target",
                    key.convention()
                )))
            }
        };

        let args: Vec<_> = key.args().iter().copied().map(ffi_type).collect();
        let mut cif = Cif::new(args, ffi_type(key.return_type()));
        cif.set_abi(abi);

        Ok(Self {
            key,
            interface: CallInterface(cif),
        })
    }

    /// The call shape this stub adapts
    pub fn key(&self) -> &SignatureKey {
        &self.key
    }

    /// Call the native function at `address` with `args`
    ///
    /// Returns `None` for a `void` return.
    ///
    /// # Safety
    ///
    /// `address` must be a live function whose native signature matches this
    /// stub's key, and the library exporting it must stay loaded for the
    /// duration of the call.
    pub unsafe fn invoke(
        &self,
        address: SymbolAddress,
        args: &[Value],
    ) -> FfiResult<Option<Value>> {
        let mut packed = PackedArgs::pack(self.key.args(), args)?;
        let mut slots = packed.slot_pointers();
        let mut ret = ReturnSlot::new();
        let code = CodePtr::from_ptr(address.as_ptr());

        trace!(signature = %self.key, address = %address, "dispatching native call");
        raw::ffi_call(
            self.interface.0.as_raw_ptr(),
            Some(*code.as_fun()),
            ret.as_mut_ptr(),
            slots.as_mut_ptr(),
        );

        ret.read(self.key.return_type())
    }
}

impl fmt::Debug for InvocationStub {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InvocationStub")
            .field("key", &self.key)
            .finish_non_exhaustive()
    }
}

/// Executor ABI for a convention, if the target distinguishes it
fn abi_for(convention: CallingConvention) -> Option<raw::ffi_abi> {
    match convention {
        CallingConvention::Cdecl => Some(raw::ffi_abi_FFI_DEFAULT_ABI),
        #[cfg(target_arch = "x86")]
        CallingConvention::Stdcall => Some(raw::ffi_abi_FFI_STDCALL),
        #[cfg(not(target_arch = "x86"))]
        CallingConvention::Stdcall => None,
    }
}
