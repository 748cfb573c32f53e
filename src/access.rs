use enumflags2::{bitflags, BitFlags};
use rdma_sys::ibv_access_flags;

/// A wrapper for `ibv_access_flags`, hiding the ibv binding types
#[bitflags]
#[repr(u64)]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum AccessFlag {
    /// local write permission
    LocalWrite,
    /// remote write permission
    RemoteWrite,
    /// remote read permission
    RemoteRead,
    /// remote atomic operation permission
    RemoteAtomic,
    /// enable memory window binding
    MwBind,
    /// use byte offset from beginning of MR to access this MR, instead of a pointer address
    ZeroBased,
    /// create an on-demand paging MR
    OnDemand,
    /// huge pages are guaranteed to be used for this MR, only used with `OnDemand`
    HugeTlb,
    /// allow system to reorder accesses to the MR to improve performance
    RelaxOrder,
}

/// Convert `BitFlags<AccessFlag>` into `ibv_access_flags`
#[inline]
#[must_use]
pub(crate) fn flags_into_ibv_access(flags: BitFlags<AccessFlag>) -> ibv_access_flags {
    let mut ret = ibv_access_flags(0);
    if flags.contains(AccessFlag::LocalWrite) {
        ret |= ibv_access_flags::IBV_ACCESS_LOCAL_WRITE;
    }
    if flags.contains(AccessFlag::RemoteWrite) {
        ret |= ibv_access_flags::IBV_ACCESS_REMOTE_WRITE;
    }
    if flags.contains(AccessFlag::RemoteRead) {
        ret |= ibv_access_flags::IBV_ACCESS_REMOTE_READ;
    }
    if flags.contains(AccessFlag::RemoteAtomic) {
        ret |= ibv_access_flags::IBV_ACCESS_REMOTE_ATOMIC;
    }
    if flags.contains(AccessFlag::MwBind) {
        ret |= ibv_access_flags::IBV_ACCESS_MW_BIND;
    }
    if flags.contains(AccessFlag::ZeroBased) {
        ret |= ibv_access_flags::IBV_ACCESS_ZERO_BASED;
    }
    if flags.contains(AccessFlag::OnDemand) {
        ret |= ibv_access_flags::IBV_ACCESS_ON_DEMAND;
    }
    if flags.contains(AccessFlag::HugeTlb) {
        ret |= ibv_access_flags::IBV_ACCESS_HUGETLB;
    }
    if flags.contains(AccessFlag::RelaxOrder) {
        ret |= ibv_access_flags::IBV_ACCESS_RELAXED_ORDERING;
    }
    ret
}

/// Convert `ibv_access_flags` into `BitFlags<AccessFlag>`
#[inline]
#[must_use]
pub(crate) fn ibv_access_into_flags(access: ibv_access_flags) -> BitFlags<AccessFlag> {
    let mut ret = BitFlags::<AccessFlag>::empty();
    if (access & ibv_access_flags::IBV_ACCESS_LOCAL_WRITE).0 != 0 {
        ret |= AccessFlag::LocalWrite;
    }
    if (access & ibv_access_flags::IBV_ACCESS_REMOTE_READ).0 != 0 {
        ret |= AccessFlag::RemoteRead;
    }
    if (access & ibv_access_flags::IBV_ACCESS_REMOTE_WRITE).0 != 0 {
        ret |= AccessFlag::RemoteWrite;
    }
    if (access & ibv_access_flags::IBV_ACCESS_REMOTE_ATOMIC).0 != 0 {
        ret |= AccessFlag::RemoteAtomic;
    }
    if (access & ibv_access_flags::IBV_ACCESS_MW_BIND).0 != 0 {
        ret |= AccessFlag::MwBind;
    }
    if (access & ibv_access_flags::IBV_ACCESS_ZERO_BASED).0 != 0 {
        ret |= AccessFlag::ZeroBased;
    }
    if (access & ibv_access_flags::IBV_ACCESS_ON_DEMAND).0 != 0 {
        ret |= AccessFlag::OnDemand;
    }
    if (access & ibv_access_flags::IBV_ACCESS_HUGETLB).0 != 0 {
        ret |= AccessFlag::HugeTlb;
    }
    if (access & ibv_access_flags::IBV_ACCESS_RELAXED_ORDERING).0 != 0 {
        ret |= AccessFlag::RelaxOrder;
    }
    ret
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_round_trip() {
        let flags = AccessFlag::LocalWrite | AccessFlag::RemoteRead | AccessFlag::RemoteWrite;
        assert_eq!(ibv_access_into_flags(flags_into_ibv_access(flags)), flags);
    }

    #[test]
    fn empty_flags_are_empty() {
        let empty = BitFlags::<AccessFlag>::empty();
        assert_eq!(flags_into_ibv_access(empty).0, 0);
        assert_eq!(ibv_access_into_flags(ibv_access_flags(0)), empty);
    }
}
