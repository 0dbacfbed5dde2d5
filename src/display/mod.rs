// =============================================================================
// Display Services — event-driven OLED and character-LCD renderers
// =============================================================================
//
// Two small subscriber services: the OLED shows the latest climate reading
// on every `dht.reading` event; the LCD keeps a map of active alerts from
// the `alert` topic and scrolls them across its bottom row. Hardware
// drivers are external collaborators behind the traits in each module;
// mock implementations log frames instead of driving I2C.
// =============================================================================

pub mod lcd;
pub mod oled;
