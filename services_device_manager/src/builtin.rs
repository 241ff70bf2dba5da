//! Built-in devices.

use crate::{CreatedDevice, DeviceFactory, DeviceManagerError};
use core_types::KeepAlive;
use kernel_api::{Capability, Device, File, FileHandle, FileKind, FileStat, IoCallback, IoResult};
use serde_json::Value;
use std::rc::Rc;

/// The empty stream: reads hit EOF, writes succeed and are discarded.
#[derive(Debug, Default)]
pub struct NullFile {
    keep_alive: KeepAlive,
}

impl NullFile {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn handle() -> FileHandle {
        Rc::new(Self::new())
    }
}

impl File for NullFile {
    fn write(&self, data: &[u8], cb: IoCallback<usize>) {
        cb(Ok(data.len()))
    }

    fn read(&self, _len: usize, _position: Option<u64>, cb: IoCallback<Vec<u8>>) {
        cb(Ok(Vec::new()))
    }

    fn stat(&self, cb: IoCallback<FileStat>) {
        cb(Ok(FileStat::new(FileKind::CharDevice, 0, 0o666)))
    }

    fn keep_alive(&self) -> &KeepAlive {
        &self.keep_alive
    }
}

struct NullDevice {
    name: String,
}

impl Device for NullDevice {
    fn kind(&self) -> &str {
        "null"
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn open(&self) -> IoResult<FileHandle> {
        Ok(NullFile::handle())
    }
}

/// Factory for `null` devices; accepts `{ "name": string }`, default `null`
pub struct NullDeviceFactory;

impl DeviceFactory for NullDeviceFactory {
    fn device_type(&self) -> &str {
        "null"
    }

    fn create(&self, args: &Value) -> Result<CreatedDevice, DeviceManagerError> {
        let name = match args.get("name") {
            None | Some(Value::Null) => "null".to_string(),
            Some(Value::String(name)) if !name.is_empty() && !name.contains('/') => name.clone(),
            Some(other) => {
                return Err(DeviceManagerError::InvalidArgs(format!(
                    "bad device name: {}",
                    other
                )))
            }
        };
        Ok(CreatedDevice {
            name: name.clone(),
            capability: Capability::Device(Rc::new(NullDevice { name })),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_null_file_reads_eof_and_swallows_writes() {
        let file = NullFile::new();
        file.write(b"discard", Box::new(|r| assert_eq!(r.unwrap(), 7)));
        file.read(10, None, Box::new(|r| assert!(r.unwrap().is_empty())));
    }

    #[test]
    fn test_null_factory_names() {
        let created = NullDeviceFactory.create(&json!({ "name": "null1" })).unwrap();
        assert_eq!(created.name, "null1");
        assert!(matches!(
            NullDeviceFactory.create(&json!({ "name": "a/b" })),
            Err(DeviceManagerError::InvalidArgs(_))
        ));
    }
}
