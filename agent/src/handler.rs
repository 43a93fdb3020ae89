//! Minimal LPC handler: logs what it sees and always falls through to the
//! real console server. Enough to exercise calibration and the interception
//! path end to end without implementing any console-semantic backend.

use log::debug;
use patch_core::{Destination, LpcHandler, Message};

pub struct PassThroughHandler;

impl LpcHandler for PassThroughHandler {
    fn handle(&self, destination: Destination, message: &mut Message) -> Option<i32> {
        debug!(
            "lpc call: destination={:?} api_index={:#x} dll_index={:#x} data_size={}",
            destination,
            message.api_index(),
            message.dll_index(),
            message.data_size()
        );
        None
    }
}
