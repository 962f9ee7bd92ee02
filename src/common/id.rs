//! Kademlia node Id or a lookup target
use std::{
    fmt::{self, Debug, Display, Formatter},
    net::IpAddr,
    str::FromStr,
};

use rand::Rng;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha3::{Digest, Sha3_256};

use crate::Error;

/// The size of node IDs in bytes.
pub const ID_SIZE: usize = 32;
/// The size of node IDs in bits, one routing table bucket per bit.
pub const ID_BITS: usize = ID_SIZE * 8;

#[derive(Clone, Copy, PartialEq, Ord, PartialOrd, Eq, Hash)]
/// Kademlia node Id or a lookup target (a record key).
pub struct Id(pub [u8; ID_SIZE]);

impl Id {
    pub fn random() -> Id {
        let mut rng = rand::thread_rng();
        let random_bytes: [u8; ID_SIZE] = rng.gen();

        Id(random_bytes)
    }

    /// Derive the stable id of a node reachable at `ip:port`.
    ///
    /// `SHA3-256("<ip>:<port>")`, so any peer can recompute and check
    /// the id another node claims for the address it was observed from.
    pub fn from_address(ip: IpAddr, port: u16) -> Id {
        let mut hasher = Sha3_256::new();
        hasher.update(format!("{ip}:{port}").as_bytes());

        Id(hasher.finalize().into())
    }

    pub fn xor(&self, other: &Id) -> Id {
        let mut result = [0_u8; ID_SIZE];

        for (i, byte) in result.iter_mut().enumerate() {
            *byte = self.0[i] ^ other.0[i];
        }

        Id(result)
    }

    /// Index of the highest bit that differs between this Id and `other`,
    /// which is the routing table bucket `other` belongs in.
    ///
    /// Returns `None` for identical ids.
    pub fn bucket_index(&self, other: &Id) -> Option<usize> {
        for i in 0..ID_SIZE {
            let diff = self.0[i] ^ other.0[i];

            if diff != 0 {
                let leading_zeros = i * 8 + diff.leading_zeros() as usize;

                return Some(ID_BITS - 1 - leading_zeros);
            }
        }

        None
    }
}

/// Returns `true` if `key` is exactly 64 hexadecimal characters.
pub fn is_valid_key(key: &str) -> bool {
    key.len() == ID_SIZE * 2 && key.bytes().all(|b| b.is_ascii_hexdigit())
}

impl Display for Id {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl Debug for Id {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "Id({self})")
    }
}

impl FromStr for Id {
    type Err = Error;

    fn from_str(s: &str) -> Result<Id, Error> {
        if !is_valid_key(s) {
            return Err(Error::InvalidId(s.to_string()));
        }

        let mut bytes = [0_u8; ID_SIZE];
        hex::decode_to_slice(s, &mut bytes).map_err(|_| Error::InvalidId(s.to_string()))?;

        Ok(Id(bytes))
    }
}

impl From<[u8; ID_SIZE]> for Id {
    fn from(bytes: [u8; ID_SIZE]) -> Id {
        Id(bytes)
    }
}

impl Serialize for Id {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Id {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Id, D::Error> {
        let s = String::deserialize(deserializer)?;

        Id::from_str(&s).map_err(serde::de::Error::custom)
    }
}
