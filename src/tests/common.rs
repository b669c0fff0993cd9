use std::fs::File;
use std::io::{self, Read, Write};
use std::sync::{Arc, Mutex};

pub fn read_whole_file(mut f: File) -> String {
    let mut content = String::new();
    f.read_to_string(&mut content).unwrap();
    content
}

/// A `Write` sink usable as a forwarder target while the test keeps a
/// handle to inspect what arrived.
#[derive(Clone, Default)]
pub struct SharedBuf(Arc<Mutex<Vec<u8>>>);

impl SharedBuf {
    pub fn new() -> SharedBuf {
        SharedBuf::default()
    }

    pub fn contents(&self) -> Vec<u8> {
        self.0.lock().unwrap().clone()
    }
}

impl Write for SharedBuf {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
