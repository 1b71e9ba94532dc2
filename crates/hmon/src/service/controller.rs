// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Service-manager contract.
//!
//! [`ServiceControl`] is what an OS service manager drives. [`ServiceController`]
//! plays that manager for a foreground process: it starts the service, then
//! turns [`ControlHandle`] requests into lifecycle calls until told to stop.

use super::processor::{ServiceProcessor, ServiceState};
use crossbeam::channel::{self, Receiver, Sender};
use std::sync::Arc;

/// Control channel capacity
const CONTROL_CHANNEL_CAPACITY: usize = 16;

/// Lifecycle hooks invoked by a service manager.
///
/// Each call returns the resulting state and must be safe to call from the
/// manager's own thread at any time, including repeatedly.
pub trait ServiceControl: Send + Sync {
    fn start_service(&self) -> ServiceState;
    fn stop_service(&self) -> ServiceState;
    fn pause_service(&self) -> ServiceState;
    fn continue_service(&self) -> ServiceState;
    fn shutdown_service(&self) -> ServiceState;
}

impl ServiceControl for ServiceProcessor {
    fn start_service(&self) -> ServiceState {
        ServiceProcessor::start_service(self)
    }

    fn stop_service(&self) -> ServiceState {
        ServiceProcessor::stop_service(self)
    }

    fn pause_service(&self) -> ServiceState {
        ServiceProcessor::pause_service(self)
    }

    fn continue_service(&self) -> ServiceState {
        ServiceProcessor::continue_service(self)
    }

    fn shutdown_service(&self) -> ServiceState {
        ServiceProcessor::shutdown_service(self)
    }
}

/// Request sent to a running controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlRequest {
    Stop,
    Pause,
    Resume,
    Shutdown,
}

/// Cloneable sender side of a controller.
#[derive(Debug, Clone)]
pub struct ControlHandle {
    sender: Sender<ControlRequest>,
}

impl ControlHandle {
    /// Stop the service and end `run`.
    pub fn stop(&self) -> bool {
        self.send(ControlRequest::Stop)
    }

    /// Suspend collection.
    pub fn pause(&self) -> bool {
        self.send(ControlRequest::Pause)
    }

    /// Resume collection.
    pub fn resume(&self) -> bool {
        self.send(ControlRequest::Resume)
    }

    /// Shut the service down and end `run`.
    pub fn shutdown(&self) -> bool {
        self.send(ControlRequest::Shutdown)
    }

    /// False once the controller has returned.
    fn send(&self, request: ControlRequest) -> bool {
        self.sender.send(request).is_ok()
    }
}

/// Foreground service manager.
pub struct ServiceController {
    service: Arc<dyn ServiceControl>,
    sender: Sender<ControlRequest>,
    receiver: Receiver<ControlRequest>,
}

impl ServiceController {
    pub fn new(service: Arc<dyn ServiceControl>) -> Self {
        let (sender, receiver) = channel::bounded(CONTROL_CHANNEL_CAPACITY);
        Self {
            service,
            sender,
            receiver,
        }
    }

    /// Handle for other threads (signal handlers, tests).
    pub fn handle(&self) -> ControlHandle {
        ControlHandle {
            sender: self.sender.clone(),
        }
    }

    /// Start the service and serve control requests until stop or shutdown.
    ///
    /// Dropping every handle counts as a stop request.
    pub fn run(self) -> ServiceState {
        let Self {
            service,
            sender,
            receiver,
        } = self;
        drop(sender);

        let state = service.start_service();
        log::info!("[CTRL] service started: {:?}", state);
        if state == ServiceState::Shutdown {
            return state;
        }

        loop {
            let request = receiver.recv().unwrap_or(ControlRequest::Stop);
            log::debug!("[CTRL] request {:?}", request);
            match request {
                ControlRequest::Pause => {
                    service.pause_service();
                }
                ControlRequest::Resume => {
                    service.continue_service();
                }
                ControlRequest::Stop => return service.stop_service(),
                ControlRequest::Shutdown => return service.shutdown_service(),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::thread;

    #[derive(Default)]
    struct Recorder {
        calls: Mutex<Vec<&'static str>>,
    }

    impl ServiceControl for Recorder {
        fn start_service(&self) -> ServiceState {
            self.calls.lock().push("start");
            ServiceState::Running
        }
        fn stop_service(&self) -> ServiceState {
            self.calls.lock().push("stop");
            ServiceState::Stopped
        }
        fn pause_service(&self) -> ServiceState {
            self.calls.lock().push("pause");
            ServiceState::Paused
        }
        fn continue_service(&self) -> ServiceState {
            self.calls.lock().push("continue");
            ServiceState::Running
        }
        fn shutdown_service(&self) -> ServiceState {
            self.calls.lock().push("shutdown");
            ServiceState::Shutdown
        }
    }

    #[test]
    fn test_requests_map_to_hooks() {
        let recorder = Arc::new(Recorder::default());
        let controller = ServiceController::new(recorder.clone());
        let handle = controller.handle();

        assert!(handle.pause());
        assert!(handle.resume());
        assert!(handle.stop());
        assert_eq!(controller.run(), ServiceState::Stopped);

        assert_eq!(
            *recorder.calls.lock(),
            vec!["start", "pause", "continue", "stop"]
        );
        assert!(!handle.stop());
    }

    #[test]
    fn test_dropped_handles_stop_service() {
        let recorder = Arc::new(Recorder::default());
        let controller = ServiceController::new(recorder.clone());
        let handle = controller.handle();

        let runner = thread::spawn(move || controller.run());
        drop(handle);

        assert_eq!(runner.join().unwrap(), ServiceState::Stopped);
        assert_eq!(*recorder.calls.lock(), vec!["start", "stop"]);
    }

    #[test]
    fn test_shutdown_ends_run() {
        let recorder = Arc::new(Recorder::default());
        let controller = ServiceController::new(recorder.clone());
        controller.handle().shutdown();
        assert_eq!(controller.run(), ServiceState::Shutdown);
    }
}
