//! # qexec-conf
//!
//! First-boot configuration rendering for qexec.
//!
//! A guest's first-boot configuration is an Ignition document. This crate
//! renders a source (the empty template or user-supplied JSON) against a
//! target schema version and applies the small set of mutations the
//! orchestrator needs: auto-login, 9p mount units and SSH keys.
//!
//! ## Quick Start
//!
//! ```
//! use qexec_conf::{render, IgnitionVersion, Source};
//!
//! # fn example() -> qexec_conf::Result<()> {
//! let mut conf = render(&Source::Empty, IgnitionVersion::V3)?;
//! conf.add_autologin();
//! conf.mount_9p("/var/mnt/workdir", true);
//!
//! let json = conf.to_json_string()?;
//! assert!(json.contains("var-mnt-workdir.mount"));
//! # Ok(())
//! # }
//! # example().unwrap();
//! ```

mod conf;
mod error;
mod units;

pub use conf::{render, Conf, IgnitionVersion, Source};
pub use error::{ConfError, Result};
pub use units::{mount_tag, systemd_escape_path, AUTOLOGIN_USER};
