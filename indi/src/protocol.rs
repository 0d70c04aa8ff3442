//! INDI XML protocol definitions and command builders

use quick_xml::escape::escape;

/// INDI protocol version announced in `getProperties`
pub const INDI_PROTOCOL_VERSION: &str = "1.7";

/// BLOB delivery policy for `enableBLOB`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlobMode {
    Never,
    Also,
    Only,
}

impl BlobMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            BlobMode::Never => "Never",
            BlobMode::Also => "Also",
            BlobMode::Only => "Only",
        }
    }
}

/// Standard INDI properties
pub mod standard_properties {
    /// Connection control switch
    pub const CONNECTION: &str = "CONNECTION";
    pub const CONNECT: &str = "CONNECT";
    pub const DISCONNECT: &str = "DISCONNECT";

    pub const DRIVER_INFO: &str = "DRIVER_INFO";
    pub const DRIVER_INTERFACE: &str = "DRIVER_INTERFACE";
    pub const CONFIG_PROCESS: &str = "CONFIG_PROCESS";
    pub const CONFIG_LOAD: &str = "CONFIG_LOAD";
    pub const POLLING_PERIOD: &str = "POLLING_PERIOD";
    pub const PERIOD_MS: &str = "PERIOD_MS";

    // Camera properties
    pub const CCD_EXPOSURE: &str = "CCD_EXPOSURE";
    pub const CCD_EXPOSURE_VALUE: &str = "CCD_EXPOSURE_VALUE";
    pub const CCD_ABORT_EXPOSURE: &str = "CCD_ABORT_EXPOSURE";
    pub const CCD_FRAME: &str = "CCD_FRAME";
    pub const CCD_BINNING: &str = "CCD_BINNING";
    pub const CCD_TEMPERATURE: &str = "CCD_TEMPERATURE";
    pub const CCD_COOLER: &str = "CCD_COOLER";
    pub const CCD_GAIN: &str = "CCD_GAIN";
    pub const CCD_OFFSET: &str = "CCD_OFFSET";
    pub const CCD_INFO: &str = "CCD_INFO";
    pub const READOUT_QUALITY: &str = "READOUT_QUALITY";
    pub const FITS_HEADER: &str = "FITS_HEADER";
    pub const WCS_CONTROL: &str = "WCS_CONTROL";
    pub const CCD1: &str = "CCD1"; // BLOB property for image data

    // Focuser properties
    pub const ABS_FOCUS_POSITION: &str = "ABS_FOCUS_POSITION";
    pub const REL_FOCUS_POSITION: &str = "REL_FOCUS_POSITION";
    pub const FOCUS_ABORT_MOTION: &str = "FOCUS_ABORT_MOTION";
    pub const FOCUS_TEMPERATURE: &str = "FOCUS_TEMPERATURE";

    // Filter wheel properties
    pub const FILTER_SLOT: &str = "FILTER_SLOT";
    pub const FILTER_NAME: &str = "FILTER_NAME";

    // Dome properties
    pub const DOME_SHUTTER: &str = "DOME_SHUTTER";
    pub const ABS_DOME_POSITION: &str = "ABS_DOME_POSITION";
    pub const DOME_ABORT_MOTION: &str = "DOME_ABORT_MOTION";

    // Dust cap / light box properties
    pub const CAP_PARK: &str = "CAP_PARK";
    pub const FLAT_LIGHT_CONTROL: &str = "FLAT_LIGHT_CONTROL";
    pub const FLAT_LIGHT_INTENSITY: &str = "FLAT_LIGHT_INTENSITY";

    // Weather properties
    pub const WEATHER_PARAMETERS: &str = "WEATHER_PARAMETERS";
    pub const WEATHER_STATUS: &str = "WEATHER_STATUS";

    // Telescope information
    pub const TELESCOPE_INFO: &str = "TELESCOPE_INFO";
}

/// `<getProperties>` for the whole server or a single device
pub fn get_properties(device: Option<&str>) -> String {
    match device {
        Some(device) => format!(
            "<getProperties version=\"{}\" device=\"{}\"/>",
            INDI_PROTOCOL_VERSION,
            escape(device)
        ),
        None => format!("<getProperties version=\"{}\"/>", INDI_PROTOCOL_VERSION),
    }
}

/// `<enableBLOB>` for a device
pub fn enable_blob(device: &str, mode: BlobMode) -> String {
    format!(
        "<enableBLOB device=\"{}\">{}</enableBLOB>",
        escape(device),
        mode.as_str()
    )
}

pub fn new_switch_vector(device: &str, property: &str, elements: &[(&str, bool)]) -> String {
    let body: String = elements
        .iter()
        .map(|(name, on)| {
            format!(
                "<oneSwitch name=\"{}\">{}</oneSwitch>",
                escape(*name),
                if *on { "On" } else { "Off" }
            )
        })
        .collect();
    format!(
        "<newSwitchVector device=\"{}\" name=\"{}\">{}</newSwitchVector>",
        escape(device),
        escape(property),
        body
    )
}

pub fn new_number_vector(device: &str, property: &str, elements: &[(&str, f64)]) -> String {
    let body: String = elements
        .iter()
        .map(|(name, value)| format!("<oneNumber name=\"{}\">{}</oneNumber>", escape(*name), value))
        .collect();
    format!(
        "<newNumberVector device=\"{}\" name=\"{}\">{}</newNumberVector>",
        escape(device),
        escape(property),
        body
    )
}

pub fn new_text_vector(device: &str, property: &str, elements: &[(&str, &str)]) -> String {
    let body: String = elements
        .iter()
        .map(|(name, value)| {
            format!(
                "<oneText name=\"{}\">{}</oneText>",
                escape(*name),
                escape(*value)
            )
        })
        .collect();
    format!(
        "<newTextVector device=\"{}\" name=\"{}\">{}</newTextVector>",
        escape(device),
        escape(property),
        body
    )
}

/// Parse an INDI number, which may be sexagesimal (`-12:30:15.5`, `12 30`)
pub fn parse_number(text: &str) -> Option<f64> {
    let text = text.trim();
    if let Ok(value) = text.parse::<f64>() {
        return Some(value);
    }
    let negative = text.starts_with('-');
    let mut total = 0.0;
    let mut divisor = 1.0;
    let mut parts = 0;
    for part in text
        .trim_start_matches(['-', '+'])
        .split(|c| c == ':' || c == ' ')
        .filter(|p| !p.is_empty())
    {
        let value: f64 = part.parse().ok()?;
        total += value / divisor;
        divisor *= 60.0;
        parts += 1;
    }
    if parts == 0 || parts > 3 {
        return None;
    }
    Some(if negative { -total } else { total })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_switch_vector_format() {
        let cmd = new_switch_vector("CCD Simulator", "CONNECTION", &[("CONNECT", true)]);
        assert_eq!(
            cmd,
            "<newSwitchVector device=\"CCD Simulator\" name=\"CONNECTION\">\
             <oneSwitch name=\"CONNECT\">On</oneSwitch></newSwitchVector>"
        );
    }

    #[test]
    fn test_number_vector_carries_all_elements() {
        let cmd = new_number_vector("CCD", "CCD_BINNING", &[("HOR_BIN", 2.0), ("VER_BIN", 2.0)]);
        assert!(cmd.contains("<oneNumber name=\"HOR_BIN\">2</oneNumber>"));
        assert!(cmd.contains("<oneNumber name=\"VER_BIN\">2</oneNumber>"));
    }

    #[test]
    fn test_text_values_are_escaped() {
        let cmd = new_text_vector("CCD", "FITS_HEADER", &[("FITS_OBJECT", "M31 & <friends>")]);
        assert!(cmd.contains("M31 &amp; &lt;friends&gt;"));
    }

    #[test]
    fn test_get_properties_for_device() {
        assert_eq!(
            get_properties(Some("Dome Simulator")),
            "<getProperties version=\"1.7\" device=\"Dome Simulator\"/>"
        );
        assert_eq!(get_properties(None), "<getProperties version=\"1.7\"/>");
    }

    #[test]
    fn test_parse_number_sexagesimal() {
        assert_eq!(parse_number("21.5"), Some(21.5));
        assert_eq!(parse_number("12:30:00"), Some(12.5));
        assert_eq!(parse_number("-10:30"), Some(-10.5));
        assert_eq!(parse_number("abc"), None);
        assert_eq!(parse_number(""), None);
    }
}
