//! Ownership token shared by a view and every view derived from it

use std::fmt;
use std::sync::Arc;

use crate::host::Host;
use crate::object::TypeRef;
use crate::props::destroy_struct;

/// Block allocated by the runtime and released when the last token drops
struct OwnedBlock {
    host: Host,
    ty: TypeRef,
    addr: usize,
}

impl Drop for OwnedBlock {
    fn drop(&mut self) {
        log::trace!("releasing owned struct at {:#x}", self.addr);
        destroy_struct(&self.host, self.ty, self.addr);
        self.host.allocator().free(self.addr);
    }
}

enum Backing {
    /// Memory owned by the host (object instances, host buffers)
    Host,
    /// Memory owned by this token
    Owned(OwnedBlock),
}

/// Reference-counted token keeping a view's backing memory alive
///
/// Cloning is cheap. For runtime-allocated memory the block is destroyed
/// field by field and freed when the last clone drops; host-backed tokens
/// never free anything.
#[derive(Clone)]
pub struct Owner(Arc<Backing>);

impl Owner {
    /// Token for memory the host owns
    pub fn host_backed() -> Self {
        Owner(Arc::new(Backing::Host))
    }

    /// Take ownership of a zeroed or initialized block holding one `ty`
    pub(crate) fn owned(host: Host, ty: TypeRef, addr: usize) -> Self {
        Owner(Arc::new(Backing::Owned(OwnedBlock { host, ty, addr })))
    }

    /// Whether the token frees its memory on last drop
    pub fn is_owning(&self) -> bool {
        matches!(*self.0, Backing::Owned(_))
    }

    /// Number of live clones
    pub fn holders(&self) -> usize {
        Arc::strong_count(&self.0)
    }

    /// Whether two tokens guard the same backing
    pub fn same_backing(&self, other: &Owner) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl fmt::Debug for Owner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &*self.0 {
            Backing::Host => f.write_str("Owner(host)"),
            Backing::Owned(block) => write!(
                f,
                "Owner(owned {:#x}, holders {})",
                block.addr,
                self.holders()
            ),
        }
    }
}
