//! [`MachineBackend`] implementation over Apple's Virtualization.framework.
//!
//! ## Lifecycle
//!
//! 1. [`VzMachine::launch`] builds a validated `VZVirtualMachineConfiguration`:
//!    - `VZLinuxBootLoader` (extracted kernel, optional initrd, cmdline)
//!    - two `VZVirtioBlockDeviceConfiguration`s: read-only squashfs root
//!      (`/dev/vda`, shared across VMs) and the writable data disk
//!      (`/dev/vdb`)
//!    - `VZNATNetworkDeviceAttachment` with a locally-administered MAC
//!    - a virtio console serial port attached to a host pipe (drained by
//!      the owning [`ProjectVm`](super::ProjectVm) into the console log)
//!    - one `VZVirtioSocketDeviceConfiguration` and one entropy device
//!    - optionally a read-only `VZSingleDirectoryShare` under the
//!      `homedir` tag
//! 2. `start()` boots on a dedicated serial dispatch queue and exposes the
//!    socket device through a [`VsockConnect`] connector.
//! 3. `request_stop()` / `force_stop()` bridge the framework's completion
//!    handlers back into async land.

use std::os::unix::io::FromRawFd;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::AsyncRead;
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::vm::{MachineBackend, MachineFactory, VmLaunchSpec};
use crate::vsock::{VsockConn, VsockConnect};

use block2::RcBlock;
use dispatch2::{DispatchQueue, DispatchQueueAttr, DispatchRetained};
use objc2::rc::Retained;
use objc2::AnyThread;
use objc2_foundation::{NSArray, NSFileHandle, NSString, NSURL};
use objc2_virtualization::*;

/// How long to wait for a vsock connection completion handler.
const VSOCK_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// How long to wait for start/stop completion handlers.
const LIFECYCLE_TIMEOUT: Duration = Duration::from_secs(30);

/// Guest-state poll cadence while waiting for power-off.
const STOP_POLL_TICK: Duration = Duration::from_millis(500);

/// Whether this host can run VZ virtual machines at all.
pub fn virtualization_supported() -> bool {
    unsafe { VZVirtualMachine::isSupported() }
}

/// Wrapper to assert `Send + Sync` for `Retained<VZVirtioSocketDevice>`.
///
/// # Safety
///
/// The only operation performed on the device from other threads is
/// `connectToPort:completionHandler:`, which dispatches onto the VZ queue
/// and is documented as safe to call from any thread.
struct SendSyncDevice(Retained<VZVirtioSocketDevice>);
unsafe impl Send for SendSyncDevice {}
unsafe impl Sync for SendSyncDevice {}

/// A Virtualization.framework guest.
pub struct VzMachine {
    vm: Retained<VZVirtualMachine>,
    vz_queue: DispatchRetained<DispatchQueue>,
    /// Filled in by the connector once the VM has started.
    device_slot: Arc<Mutex<Option<Arc<SendSyncDevice>>>>,
    console_reader: Mutex<Option<Box<dyn AsyncRead + Send + Unpin>>>,
    project_id: String,
}

// Safety: the ObjC `vm` handle is only touched through blocks dispatched
// onto `vz_queue` ("every operation on the virtual machine must be done on
// that queue"), and the socket device is behind `SendSyncDevice`.
unsafe impl Send for VzMachine {}
unsafe impl Sync for VzMachine {}

impl VzMachine {
    /// Build and validate the VM configuration. The guest is not started.
    pub fn launch(spec: VmLaunchSpec) -> Result<Self> {
        tokio::task::block_in_place(|| Self::build(spec))
    }

    fn build(spec: VmLaunchSpec) -> Result<Self> {
        let vz_queue = DispatchQueue::new("dev.discobot.vz", DispatchQueueAttr::SERIAL);

        // 1. Boot loader.
        let kernel_url =
            NSURL::fileURLWithPath(&NSString::from_str(spec.kernel.to_str().unwrap_or("")));
        let boot_loader = unsafe {
            VZLinuxBootLoader::initWithKernelURL(VZLinuxBootLoader::alloc(), &kernel_url)
        };
        if let Some(ref initrd) = spec.initrd {
            let initrd_url =
                NSURL::fileURLWithPath(&NSString::from_str(initrd.to_str().unwrap_or("")));
            unsafe { boot_loader.setInitialRamdiskURL(Some(&initrd_url)) };
        }
        let cmdline = spec.kernel_cmdline();
        unsafe { boot_loader.setCommandLine(&NSString::from_str(&cmdline)) };
        debug!(project = %spec.project_id, %cmdline, "VZ kernel cmdline");

        // 2. Base configuration.
        let vm_config = unsafe { VZVirtualMachineConfiguration::new() };
        unsafe {
            vm_config.setBootLoader(Some(&boot_loader));
            vm_config.setMemorySize(spec.memory_bytes);
            vm_config.setCPUCount(spec.cpu_count);
        }

        // 3. Block devices: /dev/vda read-only root, /dev/vdb writable data.
        let root_attachment = disk_attachment(&spec.root_disk, true)?;
        let data_attachment = disk_attachment(&spec.data_disk, false)?;
        let root_device = unsafe {
            VZVirtioBlockDeviceConfiguration::initWithAttachment(
                VZVirtioBlockDeviceConfiguration::alloc(),
                &root_attachment,
            )
        };
        let data_device = unsafe {
            VZVirtioBlockDeviceConfiguration::initWithAttachment(
                VZVirtioBlockDeviceConfiguration::alloc(),
                &data_attachment,
            )
        };
        let storage: Retained<NSArray<VZStorageDeviceConfiguration>> =
            NSArray::from_retained_slice(&[
                Retained::into_super(root_device),
                Retained::into_super(data_device),
            ]);
        unsafe { vm_config.setStorageDevices(&storage) };

        // 4. NAT networking with a locally-administered MAC.
        let nat_attachment = unsafe { VZNATNetworkDeviceAttachment::new() };
        let net_config = unsafe { VZVirtioNetworkDeviceConfiguration::new() };
        let mac = unsafe { VZMACAddress::randomLocallyAdministeredAddress() };
        unsafe {
            net_config.setAttachment(Some(&nat_attachment));
            net_config.setMACAddress(&mac);
        }
        let net_configs: Retained<NSArray<VZNetworkDeviceConfiguration>> =
            NSArray::arrayWithObject(&net_config);
        unsafe { vm_config.setNetworkDevices(&net_configs) };

        // 5. Serial console over a pipe. The guest writes to the pipe's
        // write end; the owning ProjectVm drains the read end into the
        // per-project console log.
        let mut pipe_fds = [0i32; 2];
        if unsafe { libc::pipe(pipe_fds.as_mut_ptr()) } != 0 {
            return Err(Error::Boot(format!(
                "creating console pipe: {}",
                std::io::Error::last_os_error()
            )));
        }
        let [read_fd, write_fd] = pipe_fds;
        let write_handle = unsafe {
            NSFileHandle::initWithFileDescriptor_closeOnDealloc(
                NSFileHandle::alloc(),
                write_fd,
                true,
            )
        };
        let serial_attachment = unsafe {
            VZFileHandleSerialPortAttachment::initWithFileHandleForReading_fileHandleForWriting(
                VZFileHandleSerialPortAttachment::alloc(),
                None,
                Some(&write_handle),
            )
        };
        let serial_config = unsafe { VZVirtioConsoleDeviceSerialPortConfiguration::new() };
        unsafe { serial_config.setAttachment(Some(&serial_attachment)) };
        let serial_configs: Retained<NSArray<VZSerialPortConfiguration>> =
            NSArray::arrayWithObject(&serial_config);
        unsafe { vm_config.setSerialPorts(&serial_configs) };

        let console_file = unsafe { std::fs::File::from_raw_fd(read_fd) };
        let console_reader: Box<dyn AsyncRead + Send + Unpin> =
            Box::new(tokio::fs::File::from_std(console_file));

        // 6. One vsock device for the engine socket and session ports.
        let vsock_config = unsafe { VZVirtioSocketDeviceConfiguration::new() };
        let socket_configs: Retained<NSArray<VZSocketDeviceConfiguration>> =
            NSArray::arrayWithObject(&vsock_config);
        unsafe { vm_config.setSocketDevices(&socket_configs) };

        // 7. Entropy.
        let entropy_config = unsafe { VZVirtioEntropyDeviceConfiguration::new() };
        let entropy_configs: Retained<NSArray<VZEntropyDeviceConfiguration>> =
            NSArray::arrayWithObject(&entropy_config);
        unsafe { vm_config.setEntropyDevices(&entropy_configs) };

        // 8. Optional read-only homedir share under the `homedir` tag.
        if let Some(ref homedir) = spec.homedir_share {
            let dir_url =
                NSURL::fileURLWithPath(&NSString::from_str(homedir.to_str().unwrap_or("")));
            let shared_dir = unsafe {
                VZSharedDirectory::initWithURL_readOnly(VZSharedDirectory::alloc(), &dir_url, true)
            };
            let share = unsafe {
                VZSingleDirectoryShare::initWithDirectory(
                    VZSingleDirectoryShare::alloc(),
                    &shared_dir,
                )
            };
            let fs_config = unsafe {
                VZVirtioFileSystemDeviceConfiguration::initWithTag(
                    VZVirtioFileSystemDeviceConfiguration::alloc(),
                    &NSString::from_str("homedir"),
                )
            };
            unsafe { fs_config.setShare(Some(&share)) };
            let sharing_configs: Retained<NSArray<VZDirectorySharingDeviceConfiguration>> =
                NSArray::arrayWithObject(&fs_config);
            unsafe { vm_config.setDirectorySharingDevices(&sharing_configs) };
        }

        // 9. Validate before constructing the machine.
        unsafe {
            vm_config
                .validateWithError()
                .map_err(|e| Error::Boot(format!("VZ config validation: {}", e)))?;
        }

        let vm = unsafe {
            VZVirtualMachine::initWithConfiguration_queue(
                VZVirtualMachine::alloc(),
                &vm_config,
                &vz_queue,
            )
        };

        Ok(Self {
            vm,
            vz_queue,
            device_slot: Arc::new(Mutex::new(None)),
            console_reader: Mutex::new(Some(console_reader)),
            project_id: spec.project_id,
        })
    }

    /// Run a completion-handler-based lifecycle call on the VZ queue and
    /// wait for its result.
    fn lifecycle_call(
        &self,
        what: &str,
        invoke: impl Fn(&VZVirtualMachine, RcBlock<dyn Fn(*mut objc2_foundation::NSError)>)
            + Send
            + 'static,
    ) -> Result<()> {
        let (tx, rx) = std::sync::mpsc::channel::<std::result::Result<(), String>>();

        // Safety: the VM was created on this queue and is only accessed
        // from blocks dispatched onto it.
        let vm_ptr = Retained::as_ptr(&self.vm) as usize;
        self.vz_queue.exec_async(move || {
            let vm_ref = unsafe { &*(vm_ptr as *const VZVirtualMachine) };
            let tx = std::sync::Mutex::new(Some(tx));
            let handler = RcBlock::new(move |err: *mut objc2_foundation::NSError| {
                let result = if err.is_null() {
                    Ok(())
                } else {
                    Err(unsafe { &*err }.localizedDescription().to_string())
                };
                if let Some(tx) = tx.lock().unwrap().take() {
                    let _ = tx.send(result);
                }
            });
            invoke(vm_ref, handler);
        });

        rx.recv_timeout(LIFECYCLE_TIMEOUT)
            .map_err(|_| Error::Boot(format!("VM {}: timed out", what)))?
            .map_err(|e| Error::Boot(format!("VM {}: {}", what, e)))
    }

    fn vm_state(&self) -> VZVirtualMachineState {
        let (tx, rx) = std::sync::mpsc::channel();
        let vm_ptr = Retained::as_ptr(&self.vm) as usize;
        self.vz_queue.exec_async(move || {
            let vm_ref = unsafe { &*(vm_ptr as *const VZVirtualMachine) };
            let _ = tx.send(unsafe { vm_ref.state() });
        });
        rx.recv_timeout(Duration::from_secs(5))
            .unwrap_or(VZVirtualMachineState::Error)
    }
}

#[async_trait::async_trait]
impl MachineBackend for VzMachine {
    async fn start(&self) -> Result<()> {
        tokio::task::block_in_place(|| {
            info!(project = %self.project_id, "starting VZ virtual machine");
            self.lifecycle_call("start", |vm, handler| unsafe {
                vm.startWithCompletionHandler(&handler);
            })?;

            // The socket device only exists on the live machine.
            let socket_devices = unsafe { self.vm.socketDevices() };
            if socket_devices.is_empty() {
                return Err(Error::Boot("VM has no vsock device".to_string()));
            }
            let device = socket_devices.objectAtIndex(0);
            // Safety: the only configured socket device is a
            // VZVirtioSocketDeviceConfiguration, so this is its device.
            let device: Retained<VZVirtioSocketDevice> =
                unsafe { Retained::cast_unchecked(device) };
            *self.device_slot.lock().unwrap() = Some(Arc::new(SendSyncDevice(device)));

            info!(project = %self.project_id, "VZ virtual machine started");
            Ok(())
        })
    }

    async fn request_stop(&self) -> Result<()> {
        tokio::task::block_in_place(|| {
            let (tx, rx) = std::sync::mpsc::channel::<std::result::Result<(), String>>();
            let vm_ptr = Retained::as_ptr(&self.vm) as usize;
            self.vz_queue.exec_async(move || {
                let vm_ref = unsafe { &*(vm_ptr as *const VZVirtualMachine) };
                let result = unsafe { vm_ref.requestStopWithError() }
                    .map_err(|e| e.localizedDescription().to_string());
                let _ = tx.send(result);
            });
            rx.recv_timeout(Duration::from_secs(5))
                .map_err(|_| Error::Boot("guest stop request timed out".to_string()))?
                .map_err(|e| Error::Boot(format!("guest stop request: {}", e)))
        })
    }

    async fn wait_stopped(&self) -> Result<()> {
        loop {
            let state = tokio::task::block_in_place(|| self.vm_state());
            if state == VZVirtualMachineState::Stopped || state == VZVirtualMachineState::Error {
                return Ok(());
            }
            tokio::time::sleep(STOP_POLL_TICK).await;
        }
    }

    async fn force_stop(&self) -> Result<()> {
        tokio::task::block_in_place(|| {
            self.device_slot.lock().unwrap().take();
            self.lifecycle_call("stop", |vm, handler| unsafe {
                vm.stopWithCompletionHandler(&handler);
            })
        })
    }

    fn connector(&self) -> Arc<dyn VsockConnect> {
        Arc::new(VzConnector {
            device_slot: Arc::clone(&self.device_slot),
            queue: self.vz_queue.clone(),
        })
    }

    fn take_console(&self) -> Option<Box<dyn AsyncRead + Send + Unpin>> {
        self.console_reader.lock().unwrap().take()
    }
}

/// Dials guest vsock ports through `VZVirtioSocketDevice`.
struct VzConnector {
    device_slot: Arc<Mutex<Option<Arc<SendSyncDevice>>>>,
    queue: DispatchRetained<DispatchQueue>,
}

// Safety: see `SendSyncDevice`; the queue handle is reference counted and
// thread safe.
unsafe impl Send for VzConnector {}
unsafe impl Sync for VzConnector {}

#[async_trait::async_trait]
impl VsockConnect for VzConnector {
    async fn connect(&self, port: u32) -> Result<VsockConn> {
        let device = self
            .device_slot
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| Error::Transport("VM is not running".to_string()))?;
        let queue = self.queue.clone();

        let fd = tokio::task::spawn_blocking(move || -> Result<i32> {
            let (tx, rx) = std::sync::mpsc::channel::<std::result::Result<i32, String>>();

            // Dispatch connectToPort onto the VZ queue (required by the
            // framework). The Arc moves into the block, keeping the device
            // alive until the framework is done with it.
            queue.exec_async(move || {
                let handler = RcBlock::new(
                    move |connection: *mut VZVirtioSocketConnection,
                          err: *mut objc2_foundation::NSError| {
                        if !err.is_null() {
                            let desc = unsafe { &*err }.localizedDescription().to_string();
                            let _ = tx.send(Err(desc));
                            return;
                        }
                        if connection.is_null() {
                            let _ = tx.send(Err("null vsock connection".to_string()));
                            return;
                        }
                        // Dup so we own an fd independent of the ObjC
                        // connection object, which closes its own on
                        // dealloc.
                        let raw_fd = unsafe { (*connection).fileDescriptor() };
                        let duped = unsafe { libc::dup(raw_fd) };
                        if duped < 0 {
                            let _ = tx.send(Err(format!(
                                "dup(vsock fd): {}",
                                std::io::Error::last_os_error()
                            )));
                            return;
                        }
                        let _ = tx.send(Ok(duped));
                    },
                );
                unsafe {
                    device.0.connectToPort_completionHandler(port, &handler);
                }
            });

            rx.recv_timeout(VSOCK_CONNECT_TIMEOUT)
                .map_err(|_| Error::Transport(format!("vsock connect to port {}: timed out", port)))?
                .map_err(|e| Error::Transport(format!("vsock connect to port {}: {}", port, e)))
        })
        .await
        .map_err(|e| Error::Transport(format!("vsock connect task: {}", e)))??;

        VsockConn::from_raw_fd(fd, port)
            .map_err(|e| Error::Transport(format!("wrapping vsock fd: {}", e)))
    }
}

/// Disk image attachment, read-only for the shared root.
fn disk_attachment(
    path: &std::path::Path,
    read_only: bool,
) -> Result<Retained<VZDiskImageStorageDeviceAttachment>> {
    let url = NSURL::fileURLWithPath(&NSString::from_str(path.to_str().unwrap_or("")));
    unsafe {
        VZDiskImageStorageDeviceAttachment::initWithURL_readOnly_error(
            VZDiskImageStorageDeviceAttachment::alloc(),
            &url,
            read_only,
        )
    }
    .map_err(|e| Error::Boot(format!("disk attachment {}: {}", path.display(), e)))
}

/// Machine factory handing out VZ machines.
pub fn vz_machine_factory() -> MachineFactory {
    Arc::new(|spec| {
        Box::pin(async move {
            let machine = VzMachine::launch(spec)?;
            Ok(Arc::new(machine) as Arc<dyn MachineBackend>)
        })
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    // Configuration-level checks only; booting a guest needs entitlements
    // and artifacts that unit tests don't have.

    #[test]
    fn virtualization_support_is_queryable() {
        let _ = virtualization_supported();
    }
}
