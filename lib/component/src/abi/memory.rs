//! The two abstractions the transcoder talks to: bounds-checked linear
//! memory and an allocator. Both are implemented by [`GuestMemory`],
//! which wraps a guest's exported memory together with its canonical
//! reallocation function (`cabi_realloc`).

use wasmer::{AsStoreMut, Memory, TypedFunction};

use crate::errors::{ComponentError, Error, ErrorKind, Phase};

/// The core signature of `cabi_realloc`:
/// `(old_ptr, old_size, align, new_size) -> ptr`.
pub type ReallocFn = TypedFunction<(i32, i32, i32, i32), i32>;

/// Bounds-checked byte and little-endian integer access to a linear
/// memory.
pub trait AbiMemory {
    /// Reads `len` bytes at `offset`.
    fn read(&self, offset: u32, len: u32) -> Result<Vec<u8>, Error>;

    /// Writes `bytes` at `offset`.
    fn write(&mut self, offset: u32, bytes: &[u8]) -> Result<(), Error>;

    /// Reads one byte.
    fn read_u8(&self, offset: u32) -> Result<u8, Error> {
        Ok(self.read(offset, 1)?[0])
    }

    /// Reads a little-endian `u16`.
    fn read_u16(&self, offset: u32) -> Result<u16, Error> {
        let bytes = self.read(offset, 2)?;
        Ok(u16::from_le_bytes([bytes[0], bytes[1]]))
    }

    /// Reads a little-endian `u32`.
    fn read_u32(&self, offset: u32) -> Result<u32, Error> {
        let bytes = self.read(offset, 4)?;
        Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    /// Reads a little-endian `u64`.
    fn read_u64(&self, offset: u32) -> Result<u64, Error> {
        let bytes = self.read(offset, 8)?;
        let mut buf = [0; 8];
        buf.copy_from_slice(&bytes);
        Ok(u64::from_le_bytes(buf))
    }

    /// Writes one byte.
    fn write_u8(&mut self, offset: u32, value: u8) -> Result<(), Error> {
        self.write(offset, &[value])
    }

    /// Writes a little-endian `u16`.
    fn write_u16(&mut self, offset: u32, value: u16) -> Result<(), Error> {
        self.write(offset, &value.to_le_bytes())
    }

    /// Writes a little-endian `u32`.
    fn write_u32(&mut self, offset: u32, value: u32) -> Result<(), Error> {
        self.write(offset, &value.to_le_bytes())
    }

    /// Writes a little-endian `u64`.
    fn write_u64(&mut self, offset: u32, value: u64) -> Result<(), Error> {
        self.write(offset, &value.to_le_bytes())
    }
}

/// A guest-side allocator. Alignments are powers of two.
pub trait AbiAllocator {
    /// Allocates `size` bytes aligned to `align`.
    fn alloc(&mut self, size: u32, align: u32) -> Result<u32, Error>;

    /// Releases an allocation made by [`Self::alloc`].
    fn free(&mut self, ptr: u32, size: u32, align: u32) -> Result<(), Error>;
}

fn out_of_bounds(offset: u32, len: u32, cause: wasmer::MemoryAccessError) -> Error {
    ComponentError::new(
        Phase::Runtime,
        ErrorKind::OutOfBounds,
        format!("memory access of {len} byte(s) at offset {offset}"),
    )
    .with_cause(cause)
    .into()
}

/// A guest's linear memory plus its canonical allocator, usable for the
/// duration of one call.
///
/// Accesses open short-lived [`wasmer::MemoryView`]s so the store stays
/// borrowable for the reallocation calls interleaved with them.
pub struct GuestMemory<'a, S: AsStoreMut> {
    store: &'a mut S,
    memory: Option<Memory>,
    realloc: Option<ReallocFn>,
}

impl<'a, S: AsStoreMut> GuestMemory<'a, S> {
    /// Binds a memory and allocator to a store for one call. Both are
    /// optional: flat-only signatures never touch either, and a
    /// missing one only fails the accesses that would need it.
    pub fn new(store: &'a mut S, memory: Option<Memory>, realloc: Option<ReallocFn>) -> Self {
        Self {
            store,
            memory,
            realloc,
        }
    }

    fn memory(&self) -> Result<&Memory, Error> {
        self.memory.as_ref().ok_or_else(|| {
            Error::from(ComponentError::new(
                Phase::Runtime,
                ErrorKind::NotInitialized,
                "no linear memory bound for this call",
            ))
        })
    }

    /// The store this memory is bound to.
    pub fn store(&mut self) -> &mut S {
        self.store
    }
}

impl<S: AsStoreMut> AbiMemory for GuestMemory<'_, S> {
    fn read(&self, offset: u32, len: u32) -> Result<Vec<u8>, Error> {
        let mut buf = vec![0u8; len as usize];
        self.memory()?
            .view(&*self.store)
            .read(u64::from(offset), &mut buf)
            .map_err(|e| out_of_bounds(offset, len, e))?;
        Ok(buf)
    }

    fn write(&mut self, offset: u32, bytes: &[u8]) -> Result<(), Error> {
        self.memory()?
            .view(&*self.store)
            .write(u64::from(offset), bytes)
            .map_err(|e| out_of_bounds(offset, bytes.len() as u32, e))
    }
}

impl<S: AsStoreMut> AbiAllocator for GuestMemory<'_, S> {
    fn alloc(&mut self, size: u32, align: u32) -> Result<u32, Error> {
        if size == 0 {
            return Ok(0);
        }
        let realloc = self.realloc.as_ref().ok_or_else(|| {
            Error::from(ComponentError::new(
                Phase::Encode,
                ErrorKind::NotInitialized,
                "no canonical realloc configured for this export",
            ))
        })?;
        let ptr = realloc
            .call(self.store, 0, 0, align as i32, size as i32)
            .map_err(|e| {
                Error::from(
                    ComponentError::new(
                        Phase::Encode,
                        ErrorKind::Allocation,
                        format!("guest allocation of {size} byte(s) failed"),
                    )
                    .with_cause(e),
                )
            })?;
        if ptr == 0 {
            return Err(ComponentError::new(
                Phase::Encode,
                ErrorKind::Allocation,
                format!("guest allocator returned null for {size} byte(s)"),
            )
            .into());
        }
        Ok(ptr as u32)
    }

    fn free(&mut self, ptr: u32, size: u32, align: u32) -> Result<(), Error> {
        if ptr == 0 || size == 0 {
            return Ok(());
        }
        if let Some(realloc) = self.realloc.as_ref() {
            realloc
                .call(self.store, ptr as i32, size as i32, align as i32, 0)
                .map_err(|e| {
                    Error::from(
                        ComponentError::new(
                            Phase::Encode,
                            ErrorKind::Allocation,
                            format!("guest free of {size} byte(s) at {ptr} failed"),
                        )
                        .with_cause(e),
                    )
                })?;
        }
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::abi::layout::align_to;

    /// A plain buffer with a bump allocator, standing in for guest
    /// memory in transcoder tests.
    pub struct MockMemory {
        pub bytes: Vec<u8>,
        pub next: u32,
        pub fail_alloc: bool,
        pub freed: Vec<(u32, u32, u32)>,
    }

    impl MockMemory {
        pub fn new(size: usize) -> Self {
            Self {
                bytes: vec![0; size],
                next: 16,
                fail_alloc: false,
                freed: Vec::new(),
            }
        }
    }

    impl AbiMemory for MockMemory {
        fn read(&self, offset: u32, len: u32) -> Result<Vec<u8>, Error> {
            let start = offset as usize;
            let end = start + len as usize;
            if end > self.bytes.len() {
                return Err(ComponentError::new(
                    Phase::Runtime,
                    ErrorKind::OutOfBounds,
                    format!("read of {len} byte(s) at {offset}"),
                )
                .into());
            }
            Ok(self.bytes[start..end].to_vec())
        }

        fn write(&mut self, offset: u32, data: &[u8]) -> Result<(), Error> {
            let start = offset as usize;
            let end = start + data.len();
            if end > self.bytes.len() {
                return Err(ComponentError::new(
                    Phase::Runtime,
                    ErrorKind::OutOfBounds,
                    format!("write of {} byte(s) at {offset}", data.len()),
                )
                .into());
            }
            self.bytes[start..end].copy_from_slice(data);
            Ok(())
        }
    }

    impl AbiAllocator for MockMemory {
        fn alloc(&mut self, size: u32, align: u32) -> Result<u32, Error> {
            if self.fail_alloc {
                return Err(ComponentError::new(
                    Phase::Encode,
                    ErrorKind::Allocation,
                    "mock allocator exhausted",
                )
                .into());
            }
            if size == 0 {
                return Ok(0);
            }
            let ptr = align_to(self.next, align.max(1));
            if ptr as usize + size as usize > self.bytes.len() {
                return Err(ComponentError::new(
                    Phase::Encode,
                    ErrorKind::Allocation,
                    "mock allocator exhausted",
                )
                .into());
            }
            self.next = ptr + size;
            Ok(ptr)
        }

        fn free(&mut self, ptr: u32, size: u32, align: u32) -> Result<(), Error> {
            self.freed.push((ptr, size, align));
            Ok(())
        }
    }
}
