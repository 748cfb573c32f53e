use rdma_sys::ibv_gid;

/// Rdma device gid, a 128-bit port identifier
#[derive(
    serde::Serialize, serde::Deserialize, Default, Copy, Clone, Debug, Eq, PartialEq, Hash,
)]
#[repr(transparent)]
pub struct Gid {
    /// Gid raw bytes, network order
    raw: [u8; 16],
}

impl Gid {
    /// Build a gid from its raw bytes
    #[inline]
    #[must_use]
    pub fn from_bytes(raw: [u8; 16]) -> Self {
        Self { raw }
    }

    /// The raw bytes of this gid
    #[inline]
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.raw
    }
}

impl From<ibv_gid> for Gid {
    #[inline]
    fn from(gid: ibv_gid) -> Self {
        Self {
            // SAFETY: every bit pattern of the union is a valid 16-byte array
            raw: unsafe { gid.raw },
        }
    }
}

impl From<Gid> for ibv_gid {
    #[inline]
    fn from(gid: Gid) -> Self {
        let mut ret = ibv_gid { raw: [0_u8; 16] };
        ret.raw = gid.raw;
        ret
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ibv_gid_round_trip() {
        let mut raw = [0_u8; 16];
        for (i, b) in raw.iter_mut().enumerate() {
            *b = i as u8;
        }
        let gid = Gid::from_bytes(raw);
        let ibv: ibv_gid = gid.into();
        assert_eq!(Gid::from(ibv), gid);
        assert_eq!(gid.as_bytes(), &raw);
    }
}
