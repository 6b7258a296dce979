//! Linux backend: `ip link` for link mutations, sysfs for bonding attributes.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use dashmap::DashMap;
use tracing::{debug, instrument, warn};

use crate::error::{PlatformError, PlatformResult};
use crate::link::{LinkType, PlatformLink};
use crate::platform::Platform;
use crate::shell;

/// Default sysfs mount point.
pub const DEFAULT_SYSFS_ROOT: &str = "/sys";

/// Platform backed by iproute2 and sysfs.
pub struct LinuxPlatform {
    sysfs_root: PathBuf,
    /// ifindex -> name cache, refreshed on every lookup that touches sysfs.
    names: DashMap<i32, String>,
}

impl LinuxPlatform {
    /// Creates a backend rooted at `/sys`.
    pub fn new() -> Self {
        Self::with_sysfs_root(DEFAULT_SYSFS_ROOT)
    }

    /// Creates a backend with a custom sysfs root.
    pub fn with_sysfs_root(root: impl Into<PathBuf>) -> Self {
        Self {
            sysfs_root: root.into(),
            names: DashMap::new(),
        }
    }

    fn net_dir(&self) -> PathBuf {
        self.sysfs_root.join("class").join("net")
    }

    fn bonding_attr_path(&self, iface: &str, attr: &str) -> PathBuf {
        self.net_dir().join(iface).join("bonding").join(attr)
    }

    async fn read_trimmed(path: &Path) -> PlatformResult<String> {
        tokio::fs::read_to_string(path)
            .await
            .map(|s| s.trim().to_string())
            .map_err(|source| PlatformError::Sysfs {
                path: path.to_path_buf(),
                source,
            })
    }

    async fn read_link(&self, name: &str) -> PlatformResult<Option<PlatformLink>> {
        let dir = self.net_dir().join(name);
        match tokio::fs::metadata(&dir).await {
            Ok(meta) if meta.is_dir() => {}
            // bonding_masters and other non-link entries
            _ => return Ok(None),
        }

        let ifindex_path = dir.join("ifindex");
        let raw_ifindex = match tokio::fs::read_to_string(&ifindex_path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(source) => {
                return Err(PlatformError::Sysfs {
                    path: ifindex_path,
                    source,
                })
            }
        };
        let ifindex: i32 = raw_ifindex
            .trim()
            .parse()
            .map_err(|_| PlatformError::internal(format!("bad ifindex for {}", name)))?;
        self.names.insert(ifindex, name.to_string());

        let link_type = if tokio::fs::metadata(dir.join("bonding")).await.is_ok() {
            LinkType::Bond
        } else if tokio::fs::metadata(dir.join("bridge")).await.is_ok() {
            LinkType::Bridge
        } else if name == "lo" {
            LinkType::Loopback
        } else {
            LinkType::Ethernet
        };

        let master = match tokio::fs::read_link(dir.join("master")).await {
            Ok(target) => match target.file_name().and_then(|n| n.to_str()) {
                Some(master_name) => {
                    let master_dir = self.net_dir().join(master_name);
                    Self::read_trimmed(&master_dir.join("ifindex"))
                        .await
                        .ok()
                        .and_then(|s| s.parse().ok())
                }
                None => None,
            },
            Err(_) => None,
        };

        // IFF_UP is bit 0 of the flags word
        let up = Self::read_trimmed(&dir.join("flags"))
            .await
            .ok()
            .and_then(|s| i64::from_str_radix(s.trim_start_matches("0x"), 16).ok())
            .map(|flags| flags & 0x1 != 0)
            .unwrap_or(false);

        let physical_port_id = Self::read_trimmed(&dir.join("phys_port_id"))
            .await
            .ok()
            .filter(|s| !s.is_empty());

        Ok(Some(PlatformLink {
            ifindex,
            name: name.to_string(),
            link_type,
            master,
            up,
            physical_port_id,
        }))
    }

    async fn name_of(&self, ifindex: i32) -> PlatformResult<String> {
        if let Some(name) = self.names.get(&ifindex) {
            return Ok(name.clone());
        }
        match self.link_get_by_index(ifindex).await? {
            Some(link) => Ok(link.name),
            None => Err(PlatformError::link_not_found(ifindex)),
        }
    }
}

impl Default for LinuxPlatform {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Platform for LinuxPlatform {
    fn name(&self) -> &str {
        "linux"
    }

    async fn links(&self) -> PlatformResult<Vec<PlatformLink>> {
        let net_dir = self.net_dir();
        let mut entries = tokio::fs::read_dir(&net_dir)
            .await
            .map_err(|source| PlatformError::Sysfs {
                path: net_dir.clone(),
                source,
            })?;

        let mut links = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|source| PlatformError::Sysfs {
                path: net_dir.clone(),
                source,
            })?
        {
            let Some(name) = entry.file_name().to_str().map(str::to_string) else {
                continue;
            };
            match self.read_link(&name).await {
                Ok(Some(link)) => links.push(link),
                Ok(None) => {}
                Err(e) => warn!(link = %name, error = %e, "skipping unreadable link"),
            }
        }
        links.sort_by_key(|l| l.ifindex);
        Ok(links)
    }

    async fn link_get(&self, name: &str) -> PlatformResult<Option<PlatformLink>> {
        self.read_link(name).await
    }

    async fn link_get_by_index(&self, ifindex: i32) -> PlatformResult<Option<PlatformLink>> {
        if let Some(name) = self.names.get(&ifindex).map(|n| n.clone()) {
            if let Some(link) = self.read_link(&name).await? {
                if link.ifindex == ifindex {
                    return Ok(Some(link));
                }
            }
            self.names.remove(&ifindex);
        }
        Ok(self.links().await?.into_iter().find(|l| l.ifindex == ifindex))
    }

    #[instrument(skip(self))]
    async fn create_master_link(
        &self,
        name: &str,
        link_type: LinkType,
    ) -> PlatformResult<PlatformLink> {
        let kind = link_type.kind().ok_or_else(|| {
            PlatformError::rejected("link add", format!("{} is not a software link", link_type))
        })?;
        if self.read_link(name).await?.is_some() {
            return Err(PlatformError::LinkExists {
                name: name.to_string(),
            });
        }

        shell::exec_or_err(&shell::build_link_add_cmd(name, kind)).await?;
        self.read_link(name)
            .await?
            .ok_or_else(|| PlatformError::LinkNameNotFound {
                name: name.to_string(),
            })
    }

    #[instrument(skip(self))]
    async fn link_delete(&self, ifindex: i32) -> PlatformResult<()> {
        let name = self.name_of(ifindex).await?;
        shell::exec_or_err(&shell::build_link_del_cmd(&name)).await?;
        self.names.remove(&ifindex);
        Ok(())
    }

    #[instrument(skip(self))]
    async fn enslave(&self, master: i32, slave: i32) -> PlatformResult<()> {
        let master_name = self.name_of(master).await?;
        let slave_name = self.name_of(slave).await?;
        shell::exec_or_err(&shell::build_enslave_cmd(&master_name, &slave_name)).await?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn release(&self, _master: i32, slave: i32) -> PlatformResult<()> {
        let slave_name = self.name_of(slave).await?;
        shell::exec_or_err(&shell::build_release_cmd(&slave_name)).await?;
        Ok(())
    }

    async fn set_master_attribute(
        &self,
        ifindex: i32,
        name: &str,
        value: &str,
    ) -> PlatformResult<()> {
        let iface = self.name_of(ifindex).await?;
        let path = self.bonding_attr_path(&iface, name);
        debug!(path = %path.display(), value = %value, "Writing master attribute");
        tokio::fs::write(&path, value)
            .await
            .map_err(|source| PlatformError::Sysfs { path, source })
    }

    async fn get_master_attribute(&self, ifindex: i32, name: &str) -> PlatformResult<String> {
        let iface = self.name_of(ifindex).await?;
        let path = self.bonding_attr_path(&iface, name);
        match tokio::fs::read_to_string(&path).await {
            Ok(contents) => Ok(contents.trim().to_string()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(String::new()),
            Err(source) => Err(PlatformError::Sysfs { path, source }),
        }
    }

    async fn link_set_up(&self, ifindex: i32) -> PlatformResult<()> {
        let name = self.name_of(ifindex).await?;
        shell::exec_or_err(&shell::build_link_admin_cmd(&name, true)).await?;
        Ok(())
    }

    async fn link_set_down(&self, ifindex: i32) -> PlatformResult<()> {
        let name = self.name_of(ifindex).await?;
        shell::exec_or_err(&shell::build_link_admin_cmd(&name, false)).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn fake_sysfs() -> tempfile::TempDir {
        let root = tempfile::tempdir().unwrap();
        let net = root.path().join("class/net");

        let bond = net.join("bond0");
        fs::create_dir_all(bond.join("bonding")).unwrap();
        fs::write(bond.join("ifindex"), "10\n").unwrap();
        fs::write(bond.join("flags"), "0x1003\n").unwrap();
        fs::write(bond.join("bonding/mode"), "active-backup 1\n").unwrap();
        fs::write(bond.join("bonding/arp_ip_target"), "\n").unwrap();

        let eth = net.join("eth0");
        fs::create_dir_all(&eth).unwrap();
        fs::write(eth.join("ifindex"), "2\n").unwrap();
        fs::write(eth.join("flags"), "0x1002\n").unwrap();
        fs::write(eth.join("phys_port_id"), "abcd\n").unwrap();

        root
    }

    #[tokio::test]
    async fn test_links_discovers_types() {
        let root = fake_sysfs();
        let platform = LinuxPlatform::with_sysfs_root(root.path());

        let links = platform.links().await.unwrap();
        assert_eq!(links.len(), 2);
        assert_eq!(links[0].name, "eth0");
        assert_eq!(links[0].link_type, LinkType::Ethernet);
        assert!(!links[0].up);
        assert_eq!(links[0].physical_port_id.as_deref(), Some("abcd"));
        assert_eq!(links[1].name, "bond0");
        assert_eq!(links[1].link_type, LinkType::Bond);
        assert!(links[1].up);
    }

    #[tokio::test]
    async fn test_master_attribute_read_write() {
        let root = fake_sysfs();
        let platform = LinuxPlatform::with_sysfs_root(root.path());

        assert_eq!(
            platform.get_master_attribute(10, "mode").await.unwrap(),
            "active-backup 1"
        );
        platform
            .set_master_attribute(10, "miimon", "250")
            .await
            .unwrap();
        assert_eq!(
            fs::read_to_string(root.path().join("class/net/bond0/bonding/miimon")).unwrap(),
            "250"
        );
        assert_eq!(
            platform.get_master_attribute(10, "missing").await.unwrap(),
            ""
        );
    }

    #[tokio::test]
    async fn test_unknown_ifindex() {
        let root = fake_sysfs();
        let platform = LinuxPlatform::with_sysfs_root(root.path());

        let err = platform.get_master_attribute(99, "mode").await.unwrap_err();
        assert!(matches!(err, PlatformError::LinkNotFound { ifindex: 99 }));
    }

    #[tokio::test]
    async fn test_create_rejects_hardware_type() {
        let root = fake_sysfs();
        let platform = LinuxPlatform::with_sysfs_root(root.path());

        let err = platform
            .create_master_link("eth9", LinkType::Ethernet)
            .await
            .unwrap_err();
        assert!(matches!(err, PlatformError::Rejected { .. }));
    }

    #[tokio::test]
    async fn test_create_rejects_existing_name() {
        let root = fake_sysfs();
        let platform = LinuxPlatform::with_sysfs_root(root.path());

        let err = platform
            .create_master_link("bond0", LinkType::Bond)
            .await
            .unwrap_err();
        assert!(matches!(err, PlatformError::LinkExists { .. }));
    }

    #[tokio::test]
    async fn test_links_skips_non_link_entries() {
        let root = fake_sysfs();
        let net = root.path().join("class/net");
        fs::write(net.join("bonding_masters"), "bond0\n").unwrap();
        // vanished between readdir and attribute reads
        fs::create_dir_all(net.join("veth9")).unwrap();
        let platform = LinuxPlatform::with_sysfs_root(root.path());

        let links = platform.links().await.unwrap();
        let names: Vec<_> = links.iter().map(|l| l.name.as_str()).collect();
        assert_eq!(names, vec!["eth0", "bond0"]);
        assert!(platform.link_get("bonding_masters").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_links_skips_link_with_bad_ifindex() {
        let root = fake_sysfs();
        let bad = root.path().join("class/net/dummy0");
        fs::create_dir_all(&bad).unwrap();
        fs::write(bad.join("ifindex"), "not-a-number\n").unwrap();
        let platform = LinuxPlatform::with_sysfs_root(root.path());

        let links = platform.links().await.unwrap();
        assert_eq!(links.len(), 2);
        assert!(links.iter().all(|l| l.name != "dummy0"));
    }
}
