//! LPC message and capture-buffer views, and the address transform used to
//! translate the console server's pointers into ones valid in this process.

#[cfg(target_pointer_width = "64")]
pub const CLIENT_ID_SIZE: usize = 16;
#[cfg(target_pointer_width = "32")]
pub const CLIENT_ID_SIZE: usize = 8;

/// Destination a call was headed for, determined by comparing the port
/// handle against the two handles recovered during calibration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Destination {
    Console,
    Base,
    Other,
}

/// Translates addresses between the console server's view of memory and
/// this process's, once Phase 3 of calibration has measured the delta.
#[derive(Debug, Clone, Copy, Default)]
pub struct AddressXform {
    delta: isize,
}

impl AddressXform {
    pub fn new(delta: isize) -> Self {
        Self { delta }
    }

    /// `&local − remote`, the delta to add to any pointer the server handed
    /// us in order to get one valid in our own address space.
    pub fn from_local_and_remote(local: usize, remote: usize) -> Self {
        Self {
            delta: local as isize - remote as isize,
        }
    }

    pub fn remote_to_local<T>(&self, remote: *mut T) -> *mut T {
        if remote.is_null() {
            remote
        } else {
            (remote as isize + self.delta) as *mut T
        }
    }
}

/// Generic port-message header, laid out to match the LPC wire format
/// closely enough to read the fields this crate cares about.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct PortMessageHeader {
    pub data_length: u16,
    pub total_length: u16,
    pub msg_type: u16,
    pub data_info_offset: u16,
    pub client_id: [u8; CLIENT_ID_SIZE],
    pub message_id: u32,
    pub client_view_size: usize,
}

/// Header of a capture buffer: a secondary block of pointers the server
/// uses to pass out-of-line data alongside a message.
#[repr(C)]
#[derive(Debug)]
pub struct CaptureBufferData {
    pub length: u32,
    pub related_capture_buffer: *mut CaptureBufferData,
    pub count_message_pointers: u32,
    pub free_space: *mut u8,
}

/// A console API message: a port message header plus the console-specific
/// fields the interceptor reads.
#[repr(C)]
#[derive(Debug)]
pub struct MessageData {
    pub header: PortMessageHeader,
    pub capture_buffer: *mut CaptureBufferData,
    pub api_number: u32,
    pub return_value: i32,
    pub reserved: u32,
}

/// A view onto an intercepted message, handed to the user's handler.
pub struct Message<'a> {
    data: &'a mut MessageData,
    xform: AddressXform,
}

impl<'a> Message<'a> {
    pub fn new(data: &'a mut MessageData, xform: AddressXform) -> Self {
        Self { data, xform }
    }

    pub fn api_number(&self) -> u32 {
        self.data.api_number
    }

    /// Low 16 bits: the operation being requested.
    pub fn api_index(&self) -> u16 {
        (self.data.api_number & 0xFFFF) as u16
    }

    /// High 16 bits: the DLL that owns this operation.
    pub fn dll_index(&self) -> u16 {
        ((self.data.api_number >> 16) & 0xFFFF) as u16
    }

    pub fn total_size(&self) -> usize {
        self.data.header.total_length as usize
    }

    pub fn data_size(&self) -> usize {
        self.data.header.data_length as usize
    }

    /// The capture buffer attached to this message, if any, translated
    /// through the address transform so its contents are locally
    /// addressable.
    pub fn capture_buffer(&self) -> CaptureBuffer<'_> {
        CaptureBuffer {
            remote: self.data.capture_buffer,
            xform: self.xform,
            _message: self,
        }
    }

    pub fn set_return_value(&mut self, value: i32) {
        self.data.return_value = value;
    }
}

/// A wrapper around a capture buffer pointer that is always safe to use,
/// even when the message carried none: absent buffers just report a count
/// of zero.
pub struct CaptureBuffer<'a> {
    remote: *mut CaptureBufferData,
    xform: AddressXform,
    _message: &'a Message<'a>,
}

impl CaptureBuffer<'_> {
    pub fn count(&self) -> u32 {
        let local = self.xform.remote_to_local(self.remote);
        if local.is_null() {
            0
        } else {
            unsafe { (*local).count_message_pointers }
        }
    }

    /// The raw remote pointer as embedded in the message, before address
    /// translation — this is what calibration's Phase 3 compares against a
    /// locally-known address to derive the transform delta.
    pub fn remote_address(&self) -> usize {
        self.remote as usize
    }
}
