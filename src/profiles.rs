use serde::Serialize;

/// Printer command language spoken by a profile. Only the byte-transparent
/// ESC/POS dialect is supported.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProtocolLanguage {
    EscPos,
}

/// Static descriptor of a supported USB receipt printer model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PrinterProfile {
    pub name: &'static str,
    pub vendor_id: u16,
    /// `None` matches every product of the vendor.
    pub product_id: Option<u16>,
    pub configuration: u8,
    pub interface_index: u8,
    pub language: ProtocolLanguage,
    pub codepage_mapping: &'static str,
}

impl PrinterProfile {
    const fn esc_pos(
        name: &'static str,
        vendor_id: u16,
        product_id: Option<u16>,
        codepage_mapping: &'static str,
    ) -> Self {
        Self {
            name,
            vendor_id,
            product_id,
            configuration: 1,
            interface_index: 0,
            language: ProtocolLanguage::EscPos,
            codepage_mapping,
        }
    }

    pub fn matches(&self, vendor_id: u16, product_id: u16) -> bool {
        self.vendor_id == vendor_id && self.product_id.map_or(true, |p| p == product_id)
    }
}

/// Known USB receipt printers, in priority order.
pub const DEVICE_PROFILES: &[PrinterProfile] = &[
    PrinterProfile::esc_pos("POS-8022", 0x0483, Some(0x5743), "default"),
    PrinterProfile::esc_pos("POS-5805 / POS-8360", 0x0416, Some(0x5011), "zjiang"),
    PrinterProfile::esc_pos("MPT-II", 0x0483, Some(0x5840), "mpt"),
    PrinterProfile::esc_pos("Samsung SRP", 0x1504, None, "bixolon"),
    PrinterProfile::esc_pos("Samsung SRP", 0x0419, None, "bixolon"),
    PrinterProfile::esc_pos("Epson", 0x04b8, None, "epson"),
    PrinterProfile::esc_pos("Citizen", 0x1d90, None, "citizen"),
    PrinterProfile::esc_pos("HP", 0x05d9, None, "hp"),
    PrinterProfile::esc_pos("Fujitsu", 0x04c5, None, "epson"),
    PrinterProfile::esc_pos("Dtronic", 0x0fe6, Some(0x811e), "epson"),
    PrinterProfile::esc_pos("Xprinter", 0x1fc9, Some(0x2016), "xprinter"),
];

/// First profile in `profiles` that matches the device ids.
pub fn find_profile(profiles: &[PrinterProfile], vendor_id: u16, product_id: u16) -> Option<&PrinterProfile> {
    profiles.iter().find(|p| p.matches(vendor_id, product_id))
}
