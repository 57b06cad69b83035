use crate::core::{BoardProfile, DeviceDescriptor};

/// Exact vendor/product id match between an attached device and a board
/// profile. Profiles that do not declare both ids never match.
pub fn matches(device: &DeviceDescriptor, board: &BoardProfile) -> bool {
    let (Some(vid), Some(pid)) = (board.vid.as_deref(), board.pid.as_deref()) else {
        return false;
    };

    match (parse_usb_id(vid), parse_usb_id(pid)) {
        (Some(vid), Some(pid)) => device.vendor_id == vid && device.product_id == pid,
        _ => false,
    }
}

/// Boards the device could be, in catalog order. Used to suggest a board;
/// the caller still has to confirm the choice.
pub fn candidate_boards<'a>(
    device: &DeviceDescriptor,
    boards: &'a [BoardProfile],
) -> Vec<&'a BoardProfile> {
    boards.iter().filter(|board| matches(device, board)).collect()
}

fn parse_usb_id(text: &str) -> Option<u16> {
    let text = text.trim();
    if text.is_empty() {
        return None;
    }
    u16::from_str_radix(text, 16).ok()
}
