//! systemd unit fragments injected into rendered configs.

use serde_json::{json, Value};

/// User that the auto-login fragment logs in on the consoles.
pub const AUTOLOGIN_USER: &str = "core";

/// QEMU limits 9p mount tags to 31 bytes.
const MAX_MOUNT_TAG_LEN: usize = 31;

const AUTOLOGIN_DROPIN: &str = "autologin-core.conf";

/// Getty units that receive the auto-login drop-in.
const GETTY_UNITS: [(&str, &str); 2] = [
    ("getty@.service", "--noclear"),
    ("serial-getty@.service", "--keep-baud 115200,38400,9600"),
];

/// Escape an absolute path the way `systemd-escape --path` does.
///
/// Leading and trailing slashes are dropped, inner slashes become `-`, and
/// every byte outside `[A-Za-z0-9:_.]` (plus a leading `.`) is written as
/// `\xNN`. The root path escapes to `-`.
pub fn systemd_escape_path(path: &str) -> String {
    let trimmed = path.trim_matches('/');
    if trimmed.is_empty() {
        return "-".to_string();
    }

    let mut out = String::with_capacity(trimmed.len());
    for (i, b) in trimmed.bytes().enumerate() {
        match b {
            b'/' => out.push('-'),
            b'.' if i == 0 => out.push_str("\\x2e"),
            b if b.is_ascii_alphanumeric() || b == b':' || b == b'_' || b == b'.' => {
                out.push(b as char)
            }
            b => out.push_str(&format!("\\x{b:02x}")),
        }
    }
    out
}

/// Hex digits of the guest path digest appended to every tag.
const MOUNT_TAG_DIGEST_LEN: usize = 8;

/// Mount tag shared by the hypervisor 9p device and the guest mount unit.
///
/// The final component of the guest path, cut to fit, followed by a digest
/// of the whole path. Both sides derive it from the guest path alone, and
/// shares whose paths only agree in the last component still get distinct
/// tags.
pub fn mount_tag(guest_path: &str) -> String {
    let normalized = match guest_path.trim_end_matches('/') {
        "" => "/",
        p => p,
    };
    let base = normalized
        .rsplit('/')
        .next()
        .filter(|s| !s.is_empty())
        .unwrap_or("root");

    let budget = MAX_MOUNT_TAG_LEN - MOUNT_TAG_DIGEST_LEN - 1;
    let mut tag = String::with_capacity(MAX_MOUNT_TAG_LEN);
    for c in base.chars() {
        if tag.len() + c.len_utf8() > budget {
            break;
        }
        tag.push(c);
    }

    let digest = blake3::hash(normalized.as_bytes()).to_hex();
    tag.push('-');
    tag.push_str(&digest.as_str()[..MOUNT_TAG_DIGEST_LEN]);
    tag
}

/// Drop-ins enabling auto-login on the VGA and serial gettys.
pub(crate) fn autologin_units() -> Vec<Value> {
    GETTY_UNITS
        .iter()
        .map(|(unit, agetty_args)| {
            let contents = format!(
                "[Service]\n\
                 ExecStart=\n\
                 ExecStart=-/usr/sbin/agetty --autologin {AUTOLOGIN_USER} {agetty_args} %I $TERM\n"
            );
            json!({
                "name": unit,
                "dropins": [{ "name": AUTOLOGIN_DROPIN, "contents": contents }],
            })
        })
        .collect()
}

/// A `.mount` unit that mounts the 9p share for `guest_path`.
pub(crate) fn mount_unit(guest_path: &str, read_only: bool) -> Value {
    let mut options = String::from("trans=virtio,version=9p2000.L");
    if read_only {
        options.push_str(",ro");
    }
    let contents = format!(
        "[Unit]\n\
         DefaultDependencies=no\n\
         After=systemd-tmpfiles-setup.service\n\
         Before=basic.target\n\
         [Mount]\n\
         What={tag}\n\
         Where={guest_path}\n\
         Type=9p\n\
         Options={options}\n\
         [Install]\n\
         WantedBy=multi-user.target\n",
        tag = mount_tag(guest_path),
    );
    json!({
        "name": format!("{}.mount", systemd_escape_path(guest_path)),
        "enabled": true,
        "contents": contents,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_escape_simple_path() {
        assert_eq!(systemd_escape_path("/var/mnt/workdir"), "var-mnt-workdir");
        assert_eq!(
            systemd_escape_path("/var/mnt/workdir-tmp"),
            "var-mnt-workdir\\x2dtmp"
        );
    }

    #[test]
    fn test_escape_root_and_trailing_slash() {
        assert_eq!(systemd_escape_path("/"), "-");
        assert_eq!(systemd_escape_path("/srv/data/"), "srv-data");
    }

    #[test]
    fn test_escape_leading_dot() {
        assert_eq!(systemd_escape_path("/.hidden"), "\\x2ehidden");
    }

    #[test]
    fn test_mount_tag() {
        let tag = mount_tag("/var/mnt/workdir");
        assert!(tag.starts_with("workdir-"));
        assert_eq!(tag.len(), "workdir-".len() + 8);
        assert_eq!(mount_tag("/guest/a/"), mount_tag("/guest/a"));
        assert!(mount_tag("/").starts_with("root-"));
        assert!(mount_tag(&format!("/{}", "x".repeat(40))).len() <= 31);
        assert!(mount_tag(&format!("/{}", "é".repeat(40))).len() <= 31);
    }

    #[test]
    fn test_mount_tag_distinct_for_shared_basename() {
        let a = mount_tag("/var/mnt/a/data");
        let b = mount_tag("/var/mnt/b/data");
        assert_ne!(a, b);
        assert!(a.starts_with("data-"));
        assert!(b.starts_with("data-"));
    }

    #[test]
    fn test_mount_unit_read_only() {
        let unit = mount_unit("/guest/a", true);
        assert_eq!(unit["name"], "guest-a.mount");
        let contents = unit["contents"].as_str().unwrap();
        assert!(contents.contains(&format!("What={}\n", mount_tag("/guest/a"))));
        assert!(contents.contains("Where=/guest/a\n"));
        assert!(contents.contains("Options=trans=virtio,version=9p2000.L,ro\n"));
    }

    #[test]
    fn test_autologin_units() {
        let units = autologin_units();
        assert_eq!(units.len(), 2);
        let contents = units[1]["dropins"][0]["contents"].as_str().unwrap();
        assert!(contents.contains("--autologin core"));
    }
}
