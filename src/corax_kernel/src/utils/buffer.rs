use crate::utils::{Init, RawCell};

/// Backing storage for a transfer primitive, declared by the application as
/// a `static` and handed to the primitive's constructor.
///
/// ```rust,ignore
/// static BUF: BufferStorage<u8, 16> = BufferStorage::new();
/// static MBOX: Mailbox<SystemTraits> = Mailbox::new(BUF.as_cells(), 4);
/// ```
///
/// The contents are only ever accessed by the kernel while CPU Lock is
/// active.
pub struct BufferStorage<T, const N: usize> {
    cells: [RawCell<T>; N],
}

impl<T: Init, const N: usize> BufferStorage<T, N> {
    pub const fn new() -> Self {
        Self { cells: Init::INIT }
    }
}

impl<T, const N: usize> BufferStorage<T, N> {
    /// Borrow the storage as an unsized cell slice.
    pub const fn as_cells(&self) -> &[RawCell<T>] {
        &self.cells
    }
}

impl<T: Init, const N: usize> Init for BufferStorage<T, N> {
    const INIT: Self = Self::new();
}

impl<T: Init, const N: usize> Default for BufferStorage<T, N> {
    fn default() -> Self {
        Self::new()
    }
}
