//! Payloads for records a target sends once when a trace session opens:
//! the target description and the object dictionary that maps kernel slot
//! indices to human-readable names.

/// Record identifier for an object dictionary entry.
pub const OBJ_DICT: u8 = 240;
/// Record identifier for the target description.
pub const TARGET_INFO: u8 = 241;

/// Kind tag carried in object dictionary entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ObjectKind {
    Thread = 0,
    Mutex = 1,
    Semaphore = 2,
    EventFlags = 3,
    Pool = 4,
    Queue = 5,
    Timer = 6,
}

/// Static description of the kernel build a trace stream came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetInfo {
    pub is_reset: bool,
    pub version: u16,
    pub tick_hz: u32,
    pub max_priority: u8,
    pub max_threads: u16,
    pub isr_queue_depth: u8,
    pub max_message_size: u8,
}

impl Default for TargetInfo {
    fn default() -> Self {
        Self {
            is_reset: true,
            version: 10,
            tick_hz: 1000,
            max_priority: 63,
            max_threads: 16,
            isr_queue_depth: 16,
            max_message_size: 64,
        }
    }
}

/// Produces the payload bytes for a [`TARGET_INFO`] record.
pub fn target_info_payload(info: &TargetInfo) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(12);
    bytes.push(if info.is_reset { 0xFF } else { 0x00 });
    bytes.extend_from_slice(&info.version.to_le_bytes());
    bytes.extend_from_slice(&info.tick_hz.to_le_bytes());
    bytes.push(info.max_priority);
    bytes.extend_from_slice(&info.max_threads.to_le_bytes());
    bytes.push(info.isr_queue_depth);
    bytes.push(info.max_message_size);
    bytes
}

/// Builds the payload for an [`OBJ_DICT`] record: kind, slot index, name.
pub fn obj_dict_payload(kind: ObjectKind, index: u16, name: &str) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(3 + name.len() + 1);
    bytes.push(kind as u8);
    bytes.extend_from_slice(&index.to_le_bytes());
    push_c_string(&mut bytes, name);
    bytes
}

fn push_c_string(target: &mut Vec<u8>, value: &str) {
    target.extend(value.bytes().filter(|b| *b != 0));
    target.push(0);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn target_info_layout() {
        let payload = target_info_payload(&TargetInfo::default());
        assert_eq!(payload.len(), 12);
        assert_eq!(payload[0], 0xFF);
        assert_eq!(&payload[3..7], &1000u32.to_le_bytes());
        assert_eq!(payload[7], 63);
    }

    #[test]
    fn obj_dict_is_nul_terminated() {
        let payload = obj_dict_payload(ObjectKind::Queue, 3, "rx\0q");
        assert_eq!(payload, vec![5, 3, 0, b'r', b'x', b'q', 0]);
    }
}
