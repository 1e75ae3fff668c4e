//! Capture device adapters.
//!
//! - [`still_folder`] serves stills from directories on disk.
//! - [`mock`] is a scriptable double used by unit and integration tests.
//!
//! Both implement `application::device_channel::DeviceChannel`.

pub mod mock;
pub mod still_folder;

pub use mock::MockDevice;
pub use still_folder::StillFolderDevice;
