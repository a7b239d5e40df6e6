use itertools::Itertools;

/// Formats a byte slice as a hex dump: two digits per byte, a space after
/// every eighth byte, a line break after every 64th.
pub fn hexdump(bytes: &[u8]) -> String {
    bytes
        .chunks(64)
        .map(|line| {
            line.chunks(8)
                .map(|group| group.iter().map(|byte| format!("{byte:02x}")).collect::<String>())
                .join(" ")
        })
        .join("\n")
}
