//! Mesh network resolution
//!
//! An endpoint belongs to the network its whole registry is assigned to, or
//! else to the network whose CIDR contains its address. CIDRs are kept in a
//! binary prefix trie per address family.

use std::net::IpAddr;

use ipnet::IpNet;
use tracing::warn;

use crate::config::MeshNetworks;
use crate::error::RegistryError;

#[derive(Debug, Clone, PartialEq, Eq)]
struct NamedCidr {
    network: String,
    cidr: IpNet,
}

#[derive(Debug, Default)]
struct TrieNode {
    children: [Option<Box<TrieNode>>; 2],
    /// Indexes into `PrefixTrie::entries`, in insertion order
    entries: Vec<usize>,
}

/// Binary trie over address bits; each node stores the CIDRs ending there
#[derive(Debug, Default)]
struct PrefixTrie {
    root: TrieNode,
}

impl PrefixTrie {
    fn insert(&mut self, bits: u128, width: u8, prefix_len: u8, entry: usize) {
        let mut node = &mut self.root;
        for i in 0..prefix_len {
            let bit = bit_at(bits, width, i);
            node = node.children[bit].get_or_insert_with(Box::default).as_mut();
        }
        node.entries.push(entry);
    }

    /// Entries containing `bits`, shortest prefix first
    fn containing(&self, bits: u128, width: u8) -> Vec<usize> {
        let mut out = Vec::new();
        let mut node = &self.root;
        out.extend_from_slice(&node.entries);
        for i in 0..width {
            match node.children[bit_at(bits, width, i)].as_deref() {
                Some(next) => {
                    node = next;
                    out.extend_from_slice(&node.entries);
                }
                None => break,
            }
        }
        out
    }
}

fn bit_at(bits: u128, width: u8, index: u8) -> usize {
    ((bits >> (width - 1 - index)) & 1) as usize
}

fn address_bits(ip: IpAddr) -> (u128, u8) {
    match ip {
        IpAddr::V4(v4) => (u32::from(v4) as u128, 32),
        IpAddr::V6(v6) => (u128::from(v6), 128),
    }
}

/// Resolves endpoint addresses to mesh network names
#[derive(Debug, Default)]
pub struct NetworkResolver {
    /// Network assigned to this whole registry
    registry_network: Option<String>,
    entries: Vec<NamedCidr>,
    v4: PrefixTrie,
    v6: PrefixTrie,
}

impl NetworkResolver {
    /// Build a resolver for the registry `cluster_id`
    ///
    /// CIDRs that fail to parse are logged and skipped.
    pub fn new(mesh_networks: &MeshNetworks, cluster_id: &str) -> Self {
        let mut resolver = Self::default();

        for network in &mesh_networks.networks {
            for source in &network.endpoints {
                if let Some(cidr) = source.from_cidr.as_deref().filter(|c| !c.is_empty()) {
                    match parse_cidr(cidr, &network.name) {
                        Ok(parsed) => resolver.insert(&network.name, parsed),
                        Err(e) => warn!(error = %e, "Skipping network endpoint"),
                    }
                }
                if source.from_registry.as_deref() == Some(cluster_id) {
                    resolver.registry_network = Some(network.name.clone());
                }
            }
        }

        resolver
    }

    fn insert(&mut self, network: &str, cidr: IpNet) {
        let index = self.entries.len();
        let (trie, bits, width) = match cidr {
            IpNet::V4(net) => (&mut self.v4, u32::from(net.network()) as u128, 32),
            IpNet::V6(net) => (&mut self.v6, u128::from(net.network()), 128),
        };
        trie.insert(bits, width, cidr.prefix_len(), index);
        self.entries.push(NamedCidr {
            network: network.to_string(),
            cidr,
        });
    }

    /// Network of an endpoint address, empty when none applies
    pub fn resolve_network(&self, ip: &str) -> String {
        if let Some(network) = &self.registry_network {
            return network.clone();
        }
        if self.entries.is_empty() {
            return String::new();
        }

        let Ok(addr) = ip.parse::<IpAddr>() else {
            return String::new();
        };
        let (bits, width) = address_bits(addr);
        let matches = match addr {
            IpAddr::V4(_) => self.v4.containing(bits, width),
            IpAddr::V6(_) => self.v6.containing(bits, width),
        };

        match matches.as_slice() {
            [] => String::new(),
            [only] => self.entries[*only].network.clone(),
            [first, ..] => {
                let entry = &self.entries[*first];
                warn!(
                    ip = %ip,
                    matches = matches.len(),
                    cidr = %entry.cidr,
                    network = %entry.network,
                    "Found multiple network CIDRs matching the endpoint IP, using the first match"
                );
                entry.network.clone()
            }
        }
    }

    pub fn registry_network(&self) -> Option<&str> {
        self.registry_network.as_deref()
    }

    /// Number of CIDR entries loaded
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty() && self.registry_network.is_none()
    }
}

fn parse_cidr(cidr: &str, network: &str) -> Result<IpNet, RegistryError> {
    cidr.parse::<IpNet>()
        .map(|net| net.trunc())
        .map_err(|_| RegistryError::InvalidCidr {
            cidr: cidr.to_string(),
            network: network.to_string(),
        })
}
