use super::flash_properties::FlashProperties;
use crate::serialize::hex_u_int;

use serde::{Deserialize, Serialize};

/// Entry point offset used by pack files to mark a routine as not present.
///
/// Some target files carry this value in `pc_erase_all` instead of omitting
/// the field. It is normalized away during validation; callers always have to
/// be prepared to fall back to sector-by-sector erasing.
pub const ROUTINE_NOT_PRESENT: u32 = i32::MIN as u32;

/// The raw flash algorithm is the description of a flash algorithm,
/// and is usually read from a target description file.
///
/// Before it can be used for flashing, it has to be assembled for
/// a specific chip, by laying it out in a RAM region of that chip.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct RawFlashAlgorithm {
    /// The name of the flash algorithm.
    pub name: String,
    /// The description of the algorithm.
    pub description: String,
    /// Whether this flash algorithm is the default one or not.
    #[serde(default)]
    pub default: bool,
    /// The position-dependent binary code of the algorithm.
    #[serde(deserialize_with = "deserialize")]
    #[serde(serialize_with = "serialize")]
    pub instructions: Vec<u8>,
    /// The RAM address the code has been linked against.
    #[serde(serialize_with = "hex_u_int")]
    pub load_address: u64,
    /// Offset of the `Init()` entry point, relative to `load_address`. Optional.
    pub pc_init: Option<u32>,
    /// Offset of the `UnInit()` entry point, relative to `load_address`. Optional.
    pub pc_uninit: Option<u32>,
    /// Offset of the `ProgramPage()` entry point, relative to `load_address`.
    pub pc_program_page: u32,
    /// Offset of the `EraseSector()` entry point, relative to `load_address`.
    pub pc_erase_sector: u32,
    /// Offset of the `EraseAll()` entry point, relative to `load_address`. Optional.
    pub pc_erase_all: Option<u32>,
    /// The offset from `load_address` to the start of the data section.
    ///
    /// Everything below this offset is code and must not be overwritten while
    /// the algorithm is staged.
    pub data_section_offset: u32,
    /// The properties of the flash on the device.
    pub flash_properties: FlashProperties,
    /// The cores that can use this algorithm. Empty means all cores of the chip.
    #[serde(default)]
    pub cores: Vec<String>,
}

impl RawFlashAlgorithm {
    /// The offset of the `EraseAll()` entry point, with the pack file
    /// sentinel for "not present" filtered out.
    pub fn erase_all_offset(&self) -> Option<u32> {
        self.pc_erase_all.filter(|v| *v != ROUTINE_NOT_PRESENT)
    }
}

pub(crate) fn serialize<S>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    serializer.serialize_str(&base64::encode(bytes))
}

pub(crate) fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    struct Base64Visitor;

    impl serde::de::Visitor<'_> for Base64Visitor {
        type Value = Vec<u8>;

        fn expecting(&self, formatter: &mut std::fmt::Formatter) -> std::fmt::Result {
            write!(formatter, "base64 ASCII text")
        }

        fn visit_str<E>(self, v: &str) -> Result<Self::Value, E>
        where
            E: serde::de::Error,
        {
            base64::decode(v).map_err(serde::de::Error::custom)
        }
    }

    deserializer.deserialize_str(Base64Visitor)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn instructions_serialize_as_base64() {
        let algorithm = RawFlashAlgorithm {
            name: "algo".into(),
            instructions: vec![0x00, 0xbe, 0x70, 0x47],
            load_address: 0x2000_0000,
            pc_program_page: 0x20,
            pc_erase_sector: 0x40,
            ..Default::default()
        };

        let text = serde_yaml::to_string(&algorithm).unwrap();
        assert!(text.contains("AL5wRw=="));
    }

    #[test]
    fn algorithm_deserializes_from_yaml() {
        let yaml = r#"
            name: algo
            description: An algorithm
            instructions: AL5wRw==
            load_address: 0x20000020
            pc_init: 0x0
            pc_uninit: null
            pc_program_page: 0x20
            pc_erase_sector: 0x40
            pc_erase_all: null
            data_section_offset: 0x100
            flash_properties:
              address_range:
                start: 0x8000000
                end: 0x8010000
              page_size: 0x400
              erased_byte_value: 0xff
              program_page_timeout: 500
              erase_sector_timeout: 3000
              sectors:
                - size: 0x1000
                  address: 0x0
        "#;

        let parsed: RawFlashAlgorithm = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(parsed.instructions, vec![0x00, 0xbe, 0x70, 0x47]);
        assert_eq!(parsed.load_address, 0x2000_0020);
        assert_eq!(parsed.pc_init, Some(0));
        assert_eq!(parsed.pc_uninit, None);
        assert_eq!(parsed.flash_properties.page_size, 0x400);
        assert_eq!(parsed.flash_properties.sectors.len(), 1);
        assert!(!parsed.default);
        assert!(parsed.cores.is_empty());
    }

    #[test]
    fn erase_all_sentinel_reads_as_not_present() {
        let algorithm = RawFlashAlgorithm {
            pc_erase_all: Some(ROUTINE_NOT_PRESENT),
            ..Default::default()
        };
        assert_eq!(algorithm.erase_all_offset(), None);

        let algorithm = RawFlashAlgorithm {
            pc_erase_all: Some(0x100),
            ..Default::default()
        };
        assert_eq!(algorithm.erase_all_offset(), Some(0x100));
    }
}
