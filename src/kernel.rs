//! Kernel-launch seam between the backend stage and a concrete device runtime.
//!
//! Launch reports success as a plain `bool`; backend closures turn a `false`
//! into [`Error::Device`](crate::Error::Device) so the failure flows through
//! the same promise-poisoning path as every other task error.

use crate::op::DeviceAddress;

/// A launchable kernel. Addresses are pre-allocated by the caller; the
/// executor only orders the launch on `stream_id` and reports whether the
/// submission was accepted.
pub trait KernelExecutor {
    fn launch(
        &self,
        inputs: &[DeviceAddress],
        workspace: &[DeviceAddress],
        outputs: &[DeviceAddress],
        stream_id: usize,
    ) -> bool;
}

#[cfg(test)]
mod tests {
    use super::*;

    struct AlwaysFails;

    impl KernelExecutor for AlwaysFails {
        fn launch(
            &self,
            _inputs: &[DeviceAddress],
            _workspace: &[DeviceAddress],
            _outputs: &[DeviceAddress],
            _stream_id: usize,
        ) -> bool {
            false
        }
    }

    #[test]
    fn failed_launch_maps_to_device_error() {
        let exec = AlwaysFails;
        let launched = exec.launch(&[], &[], &[], 0);
        let result: crate::Result<()> = if launched {
            Ok(())
        } else {
            Err(crate::Error::device("kernel launch failed"))
        };
        assert!(matches!(result, Err(crate::Error::Device(_))));
    }
}
