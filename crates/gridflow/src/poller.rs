//! Event sources that report new or changed artifacts in an inbox.
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use crate::common::error::GridError;
use crate::{Map, Result};

bitflags::bitflags! {
    /// Kind of change, with the same bit values as inotify.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct EventMask: u32 {
        const ACCESS        = 0x0000_0001;
        const MODIFY        = 0x0000_0002;
        const ATTRIB        = 0x0000_0004;
        const CLOSE_WRITE   = 0x0000_0008;
        const CLOSE_NOWRITE = 0x0000_0010;
        const OPEN          = 0x0000_0020;
        const MOVED_FROM    = 0x0000_0040;
        const MOVED_TO      = 0x0000_0080;
        const CREATE        = 0x0000_0100;
        const DELETE        = 0x0000_0200;
        const DELETE_SELF   = 0x0000_0400;
        const MOVE_SELF     = 0x0000_0800;
        const ISDIR         = 0x4000_0000;
    }
}

pub trait Poller {
    /// Changes since the previous call, as `(url, mask)` pairs.
    fn get_events(&mut self) -> Result<Vec<(String, EventMask)>>;
}

#[derive(Clone, Copy, PartialEq, Eq)]
struct Entry {
    modified: SystemTime,
    is_dir: bool,
}

/// Watches the entries of one local directory by comparing modification times.
pub struct DirectoryPoller {
    root: PathBuf,
    entries: Map<PathBuf, Entry>,
}

impl DirectoryPoller {
    /// Entries already present when the poller is created produce no events.
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        if !root.exists() {
            log::warn!("Inbox {} does not exist, creating it", root.display());
            std::fs::create_dir_all(&root)?;
        }
        let entries = scan(&root)?;
        Ok(Self { root, entries })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

fn scan(root: &Path) -> Result<Map<PathBuf, Entry>> {
    let mut entries = Map::new();
    for item in std::fs::read_dir(root)? {
        let item = item?;
        let metadata = match item.metadata() {
            Ok(metadata) => metadata,
            // removed between listing and stat
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => continue,
            Err(error) => return Err(error.into()),
        };
        entries.insert(
            item.path(),
            Entry {
                modified: metadata.modified()?,
                is_dir: metadata.is_dir(),
            },
        );
    }
    Ok(entries)
}

fn file_url(path: &Path) -> String {
    format!("file://{}", path.display())
}

impl Poller for DirectoryPoller {
    fn get_events(&mut self) -> Result<Vec<(String, EventMask)>> {
        let current = scan(&self.root)?;
        let mut events = Vec::new();
        for (path, entry) in &current {
            let dir_flag = if entry.is_dir {
                EventMask::ISDIR
            } else {
                EventMask::empty()
            };
            match self.entries.get(path) {
                None => events.push((file_url(path), EventMask::CREATE | dir_flag)),
                Some(previous) if previous.modified != entry.modified => events.push((
                    file_url(path),
                    EventMask::MODIFY | EventMask::CLOSE_WRITE | dir_flag,
                )),
                Some(_) => {}
            }
        }
        for (path, entry) in &self.entries {
            if !current.contains_key(path) {
                let mut mask = EventMask::DELETE;
                if entry.is_dir {
                    mask |= EventMask::ISDIR;
                }
                events.push((file_url(path), mask));
            }
        }
        events.sort_by(|a, b| a.0.cmp(&b.0));
        if !events.is_empty() {
            log::debug!("{} event(s) in {}", events.len(), self.root.display());
        }
        self.entries = current;
        Ok(events)
    }
}

/// Poller for `url`. Plain paths and `file://` URLs are watched as local directories.
pub fn make_poller(url: &str) -> Result<Box<dyn Poller>> {
    let path = match url.split_once("://") {
        None => url,
        Some(("file", path)) => path,
        Some((scheme, _)) => {
            return Err(GridError::InvalidArgument(format!(
                "no poller for `{scheme}` URLs ({url})"
            )));
        }
    };
    if path.is_empty() {
        return Err(GridError::InvalidArgument(format!("empty inbox path in {url}")));
    }
    Ok(Box::new(DirectoryPoller::new(path)?))
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::time::{Duration, SystemTime};

    use crate::common::error::GridError;
    use crate::poller::{DirectoryPoller, EventMask, Poller, file_url, make_poller};

    #[test]
    fn test_existing_entries_are_not_reported() {
        let dir = tempfile::TempDir::new().unwrap();
        fs::write(dir.path().join("old.txt"), "x").unwrap();
        let mut poller = DirectoryPoller::new(dir.path()).unwrap();
        assert!(poller.get_events().unwrap().is_empty());
    }

    #[test]
    fn test_create_modify_delete() {
        let dir = tempfile::TempDir::new().unwrap();
        let mut poller = DirectoryPoller::new(dir.path()).unwrap();

        let file = dir.path().join("input.dat");
        fs::write(&file, "1").unwrap();
        fs::create_dir(dir.path().join("batch")).unwrap();
        let events = poller.get_events().unwrap();
        assert_eq!(
            events,
            vec![
                (
                    file_url(&dir.path().join("batch")),
                    EventMask::CREATE | EventMask::ISDIR
                ),
                (file_url(&file), EventMask::CREATE),
            ]
        );
        assert!(poller.get_events().unwrap().is_empty());

        let later = SystemTime::now() + Duration::from_secs(10);
        fs::File::options()
            .write(true)
            .open(&file)
            .unwrap()
            .set_modified(later)
            .unwrap();
        assert_eq!(
            poller.get_events().unwrap(),
            vec![(file_url(&file), EventMask::MODIFY | EventMask::CLOSE_WRITE)]
        );

        fs::remove_file(&file).unwrap();
        assert_eq!(
            poller.get_events().unwrap(),
            vec![(file_url(&file), EventMask::DELETE)]
        );
    }

    #[test]
    fn test_missing_directory_is_created() {
        let dir = tempfile::TempDir::new().unwrap();
        let inbox = dir.path().join("inbox");
        let poller = DirectoryPoller::new(&inbox).unwrap();
        assert!(inbox.is_dir());
        assert_eq!(poller.root(), inbox);
    }

    #[test]
    fn test_make_poller() {
        let dir = tempfile::TempDir::new().unwrap();
        let url = format!("file://{}", dir.path().display());
        let mut poller = make_poller(&url).unwrap();
        fs::write(dir.path().join("a"), "").unwrap();
        assert_eq!(poller.get_events().unwrap().len(), 1);

        assert!(make_poller(dir.path().to_str().unwrap()).is_ok());
        assert!(matches!(
            make_poller("s3://bucket/inbox"),
            Err(GridError::InvalidArgument(_))
        ));
        assert!(matches!(
            make_poller("file://"),
            Err(GridError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_mask_values_match_inotify() {
        assert_eq!(EventMask::CREATE.bits(), 0x100);
        assert_eq!(EventMask::CLOSE_WRITE.bits(), 0x8);
        assert_eq!((EventMask::DELETE | EventMask::ISDIR).bits(), 0x4000_0200);
    }
}
