use serde::{Deserialize, Serialize};

/// Device catalog of the machine under test.
///
/// The defaults describe the reference host: 30 NVMe drives spread over four
/// PCIe root complexes, each drive reachable either as a raw block device or
/// through a per-drive mount.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Catalog {
    /// Stable raw block device paths, in root complex order.
    pub raw_devices: Vec<String>,
    /// Per-device benchmark file when testing through the file system.
    pub fs_files: Vec<String>,
    /// Sizes of the root complex groups, in catalog order.
    pub root_complex_sizes: Vec<usize>,
    /// Benchmark binary to invoke.
    pub program: String,
}

// taken from `ls -l /dev/disk/by-path`; 08:00.0 holds the operating system
// and is left out of the catalog
const PCI_SLOTS: [&str; 30] = [
    "01", "02", "03", "04", "05", "06", "07", "23", "2a", "2b", "2c", "2d", "2e", "2f", "41", "42",
    "43", "44", "45", "46", "47", "48", "61", "62", "63", "64", "65", "66", "67", "68",
];

impl Default for Catalog {
    fn default() -> Self {
        Catalog {
            raw_devices: PCI_SLOTS
                .iter()
                .map(|slot| format!("/dev/disk/by-path/pci-0000:{slot}:00.0-nvme-1"))
                .collect(),
            fs_files: (0..PCI_SLOTS.len()).map(|i| format!("/mnt/ssd{i}/fio")).collect(),
            root_complex_sizes: vec![7, 7, 8, 8],
            program: "fio".to_owned(),
        }
    }
}

impl Catalog {
    /// Target paths for the chosen addressing mode.
    pub fn targets(&self, file_system: bool) -> &[String] {
        if file_system { &self.fs_files } else { &self.raw_devices }
    }
}
