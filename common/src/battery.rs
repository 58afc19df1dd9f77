use crate::config::BatterySection;

/// Maps a raw analog reading onto 0..=100 using two calibration anchors.
///
/// Readings outside the anchors clamp. Bounds with `high <= low` cannot be
/// interpolated; they report 0 at or below `low` and 100 above it.
pub fn percent(raw: u16, low: u16, high: u16) -> u8 {
    if high <= low {
        return if raw <= low { 0 } else { 100 };
    }

    let span = f32::from(high - low);
    let offset = f32::from(raw) - f32::from(low);
    let value = (offset / span * 100.0) as i32;
    value.clamp(0, 100) as u8
}

impl BatterySection {
    pub fn percent(&self, raw: u16) -> u8 {
        percent(raw, self.min_level, self.max_level)
    }
}
