// Resource specifications for tasks and machines.
//
// The same record describes both what a task needs and what a node currently
// has free; admission is a componentwise comparison between the two.

use serde::{Deserialize, Serialize};

use crate::bytes::ByteQuantity;

/// The resources a task asks for, or a node offers.
///
/// GPUs are counted board-wise: `gpus` is a slot count on a single board and
/// `gpu_mem` the memory on that board. A zero `gpu_mem` need matches any
/// offer.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Resource {
    #[serde(default)]
    pub cpus: u32,

    #[serde(default)]
    pub gpus: u32,

    #[serde(default)]
    pub hdd: ByteQuantity,

    #[serde(default)]
    pub ram: ByteQuantity,

    #[serde(rename = "gpuMem", default)]
    pub gpu_mem: ByteQuantity,
}

impl Resource {
    /// Componentwise check that `self`, read as a need, can be satisfied by
    /// `have`. Every dimension must fit; there is no partial admission.
    pub fn fits(&self, have: &Resource) -> bool {
        self.cpus <= have.cpus
            && self.gpus <= have.gpus
            && self.hdd <= have.hdd
            && self.ram <= have.ram
            && self.gpu_mem <= have.gpu_mem
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn res(cpus: u32, gpus: u32, hdd: u64, ram: u64, gpu_mem: u64) -> Resource {
        Resource {
            cpus,
            gpus,
            hdd: ByteQuantity::from_bytes(hdd),
            ram: ByteQuantity::from_bytes(ram),
            gpu_mem: ByteQuantity::from_bytes(gpu_mem),
        }
    }

    #[test]
    fn fit_is_componentwise() {
        let need = res(2, 0, 1_000, 2_000, 0);
        let have = res(4, 0, 10_000, 8_000, 0);
        assert!(need.fits(&have));

        // One failing dimension sinks the whole check.
        let starved = res(4, 0, 10_000, 1_000, 0);
        assert!(!need.fits(&starved));
    }

    #[test]
    fn fit_is_monotone_in_the_offer() {
        let need = res(1, 1, 500, 500, 500);
        let have = res(2, 2, 1_000, 1_000, 1_000);
        let bigger = res(3, 2, 2_000, 1_000, 1_500);
        assert!(need.fits(&have));
        assert!(need.fits(&bigger));
    }

    #[test]
    fn zero_gpu_mem_matches_anything() {
        let need = res(1, 0, 0, 0, 0);
        assert!(need.fits(&res(1, 0, 0, 0, 0)));
        assert!(need.fits(&res(8, 4, 1, 1, 1)));
    }

    #[test]
    fn wire_round_trip() {
        let json = r#"{"cpus":4,"gpus":1,"hdd":"10Gb","ram":"8Gb","gpuMem":"6GiB"}"#;
        let need: Resource = serde_json::from_str(json).unwrap();
        assert_eq!(need.cpus, 4);
        assert_eq!(need.ram.as_u64(), 8_000_000_000);

        let again: Resource =
            serde_json::from_str(&serde_json::to_string(&need).unwrap()).unwrap();
        assert_eq!(again, need);
    }

    #[test]
    fn missing_gpu_mem_reads_as_zero() {
        let json = r#"{"cpus":1,"gpus":0,"hdd":"1Gb","ram":"1Gb"}"#;
        let need: Resource = serde_json::from_str(json).unwrap();
        assert!(need.gpu_mem.is_zero());
    }
}
