//! The WireGuard engine seam.
//!
//! The data plane is an external collaborator. On Unix it is boringtun's
//! userspace device, created in-process per tunnel; on Windows it is the
//! out-of-process engine reached over the WireGuard named pipe. Either way
//! the control channel is the UAPI text protocol and [`UapiClient`] is the
//! supervisor's handle to it.

use std::io;

use tokio::io::{AsyncBufReadExt as _, AsyncWriteExt as _, BufReader};

use crate::uapi;

#[derive(Debug, thiserror::Error)]
pub enum DeviceError {
    #[error("failed to create device: {0}")]
    Create(String),
    #[error("UAPI I/O: {0}")]
    Io(#[from] io::Error),
    #[error("UAPI request failed with errno {0}")]
    Errno(i32),
}

/// Client side of the engine's UAPI channel. Cheap to clone; every request
/// opens a fresh connection, as the protocol expects.
#[derive(Debug, Clone)]
pub struct UapiClient {
    #[cfg(unix)]
    path: std::path::PathBuf,
    #[cfg(windows)]
    pipe: String,
}

impl UapiClient {
    pub fn for_interface(name: &str) -> Self {
        #[cfg(unix)]
        {
            Self {
                path: std::path::PathBuf::from(format!("/var/run/wireguard/{name}.sock")),
            }
        }
        #[cfg(windows)]
        {
            Self {
                pipe: format!(r"\\.\pipe\ProtectedPrefix\Administrators\WireGuard\{name}"),
            }
        }
    }

    /// Applies a configuration body (`set=1` framing added here).
    pub async fn set(&self, body: &str) -> Result<(), DeviceError> {
        let request = format!("set=1\n{body}\n");
        let response = self.roundtrip(&request).await?;

        match uapi::parse_errno(&response) {
            Some(0) | None => Ok(()),
            Some(errno) => Err(DeviceError::Errno(errno)),
        }
    }

    /// Fetches the full device state as UAPI text (without the errno line).
    pub async fn get(&self) -> Result<String, DeviceError> {
        let response = self.roundtrip("get=1\n\n").await?;

        match uapi::parse_errno(&response) {
            Some(0) | None => {}
            Some(errno) => return Err(DeviceError::Errno(errno)),
        }

        Ok(response
            .lines()
            .filter(|line| !line.starts_with("errno="))
            .collect::<Vec<_>>()
            .join("\n"))
    }

    async fn roundtrip(&self, request: &str) -> Result<String, DeviceError> {
        let stream = self.connect().await?;
        let mut stream = BufReader::new(stream);

        stream.get_mut().write_all(request.as_bytes()).await?;

        let mut response = String::new();
        let mut line = String::new();
        loop {
            line.clear();
            let read = stream.read_line(&mut line).await?;
            // The response terminates with an empty line (or EOF).
            if read == 0 || line == "\n" {
                break;
            }
            response.push_str(&line);
        }

        Ok(response)
    }

    #[cfg(unix)]
    async fn connect(&self) -> io::Result<tokio::net::UnixStream> {
        tokio::net::UnixStream::connect(&self.path).await
    }

    #[cfg(windows)]
    async fn connect(&self) -> io::Result<tokio::net::windows::named_pipe::NamedPipeClient> {
        tokio::net::windows::named_pipe::ClientOptions::new().open(&self.pipe)
    }
}

/// The engine instance behind one tunnel.
pub struct Device {
    name: String,
    #[cfg(unix)]
    handle: Option<boringtun::device::DeviceHandle>,
}

impl Device {
    /// Creates the userspace engine (and with it the TUN interface) for
    /// `name`. Blocking: call from a blocking-friendly context.
    #[cfg(unix)]
    pub fn create(name: &str) -> Result<Self, DeviceError> {
        let config = boringtun::device::DeviceConfig {
            n_threads: 4,
            #[cfg(target_os = "linux")]
            uapi_fd: -1,
            use_connected_socket: true,
            #[cfg(target_os = "linux")]
            use_multi_queue: true,
        };

        let handle = boringtun::device::DeviceHandle::new(name, config)
            .map_err(|e| DeviceError::Create(format!("{e:?}")))?;

        tracing::debug!(%name, "Created userspace WireGuard device");
        Ok(Self {
            name: name.to_owned(),
            handle: Some(handle),
        })
    }

    /// On Windows the engine runs out of process and owns the adapter; we
    /// only verify the control channel is reachable.
    #[cfg(windows)]
    pub fn create(name: &str) -> Result<Self, DeviceError> {
        Ok(Self {
            name: name.to_owned(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn uapi(&self) -> UapiClient {
        UapiClient::for_interface(&self.name)
    }

    /// Stops the engine. Idempotent.
    pub fn close(&mut self) {
        #[cfg(unix)]
        if let Some(handle) = self.handle.take() {
            // Dropping the handle triggers the device's exit path and
            // cleans up its UAPI socket.
            drop(handle);
            tracing::debug!(name = %self.name, "Closed userspace WireGuard device");
        }
        #[cfg(windows)]
        {
            tracing::debug!(name = %self.name, "Released engine control channel");
        }
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        self.close();
    }
}
