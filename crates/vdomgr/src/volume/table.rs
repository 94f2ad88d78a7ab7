//! The device-mapper table line realizing a volume.
//!
//! Space-separated tokens in a fixed order, version `V2`:
//!
//! ```text
//! 0 <numSectors> vdo V2 <backingDev> <physicalBlocks> <logicalBlockSize>
//! <cacheBlocks> <blockMapPeriod> <mdRaid5Mode> <writePolicy> <name>
//! maxDiscard <maxDiscardBlocks> ack <n> bio <n> bioRotationInterval <n>
//! cpu <n> hash <n> logical <n> physical <n>
//! ```
//!
//! Sizes are in 512-byte sectors or 4 KiB blocks as noted.

use std::collections::HashMap;
use std::fmt;

use crate::config::VdoRecord;
use crate::defaults::Defaults;
use crate::types::WritePolicy;
use crate::{Result, VdoError};

const TABLE_VERSION: &str = "V2";

/// A parsed (or to-be-emitted) table line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DmTable {
    pub logical_start: u64,
    pub num_sectors: u64,
    pub storage_device: String,
    pub physical_blocks: u64,
    pub logical_block_size: u32,
    pub cache_blocks: u64,
    pub block_map_period: u32,
    pub md_raid5_mode: String,
    pub write_policy: WritePolicy,
    pub pool_name: String,
    pub max_discard_blocks: u64,
    pub ack_threads: u32,
    pub bio_threads: u32,
    pub bio_rotation_interval: u32,
    pub cpu_threads: u32,
    pub hash_zone_threads: u32,
    pub logical_threads: u32,
    pub physical_threads: u32,
}

impl DmTable {
    /// Composes the table for a volume from its registry record.
    pub fn from_record(record: &VdoRecord) -> DmTable {
        DmTable {
            logical_start: 0,
            num_sectors: record.logical_size.to_sectors(),
            storage_device: record.device.display().to_string(),
            physical_blocks: record.physical_size.to_blocks(),
            logical_block_size: record.logical_block_size,
            cache_blocks: record.block_map_cache_size.to_blocks(),
            block_map_period: record.block_map_period,
            md_raid5_mode: Defaults::MD_RAID5_MODE.to_string(),
            write_policy: record.write_policy,
            pool_name: record.name.clone(),
            max_discard_blocks: record.max_discard_size.to_blocks(),
            ack_threads: record.ack_threads,
            bio_threads: record.bio_threads,
            bio_rotation_interval: record.bio_rotation_interval,
            cpu_threads: record.cpu_threads,
            hash_zone_threads: record.hash_zone_threads,
            logical_threads: record.logical_threads,
            physical_threads: record.physical_threads,
        }
    }

    /// Parses a table line as reported by `dmsetup table`.
    pub fn parse(line: &str) -> Result<DmTable> {
        let bad = |detail: String| {
            VdoError::System(format!("unparsable device-mapper table: {detail}"))
        };
        let tokens: Vec<&str> = line.split_whitespace().collect();
        if tokens.len() < 12 {
            return Err(bad(format!("{} tokens", tokens.len())));
        }
        if tokens[2] != Defaults::TARGET_NAME {
            return Err(bad(format!("target {}", tokens[2])));
        }
        if tokens[3] != TABLE_VERSION {
            return Err(bad(format!("format version {}", tokens[3])));
        }

        let int = |index: usize| -> Result<u64> {
            tokens[index]
                .parse()
                .map_err(|_| bad(format!("field {index} = {}", tokens[index])))
        };

        let mut pairs = HashMap::new();
        let mut rest = tokens[12..].chunks_exact(2);
        for chunk in &mut rest {
            pairs.insert(chunk[0], chunk[1]);
        }
        let pair = |key: &str| -> Result<u64> {
            pairs
                .get(key)
                .and_then(|v| v.parse().ok())
                .ok_or_else(|| bad(format!("missing {key}")))
        };

        Ok(DmTable {
            logical_start: int(0)?,
            num_sectors: int(1)?,
            storage_device: tokens[4].to_string(),
            physical_blocks: int(5)?,
            logical_block_size: int(6)? as u32,
            cache_blocks: int(7)?,
            block_map_period: int(8)? as u32,
            md_raid5_mode: tokens[9].to_string(),
            write_policy: tokens[10]
                .parse()
                .map_err(|e| bad(format!("write policy: {e}")))?,
            pool_name: tokens[11].to_string(),
            max_discard_blocks: pair("maxDiscard")?,
            ack_threads: pair("ack")? as u32,
            bio_threads: pair("bio")? as u32,
            bio_rotation_interval: pair("bioRotationInterval")? as u32,
            cpu_threads: pair("cpu")? as u32,
            hash_zone_threads: pair("hash")? as u32,
            logical_threads: pair("logical")? as u32,
            physical_threads: pair("physical")? as u32,
        })
    }
}

impl fmt::Display for DmTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} {} {TABLE_VERSION} {} {} {} {} {} {} {} {} \
             maxDiscard {} ack {} bio {} bioRotationInterval {} cpu {} \
             hash {} logical {} physical {}",
            self.logical_start,
            self.num_sectors,
            Defaults::TARGET_NAME,
            self.storage_device,
            self.physical_blocks,
            self.logical_block_size,
            self.cache_blocks,
            self.block_map_period,
            self.md_raid5_mode,
            self.write_policy,
            self.pool_name,
            self.max_discard_blocks,
            self.ack_threads,
            self.bio_threads,
            self.bio_rotation_interval,
            self.cpu_threads,
            self.hash_zone_threads,
            self.logical_threads,
            self.physical_threads,
        )
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn record() -> VdoRecord {
        let mut record = VdoRecord::new("vol1", "/dev/sdx");
        record.logical_size = "2T".parse().unwrap();
        record.physical_size = "10G".parse().unwrap();
        record
    }

    #[test]
    fn composes_the_contractual_token_order() {
        let table = DmTable::from_record(&record()).to_string();
        assert_eq!(
            table,
            "0 4294967296 vdo V2 /dev/sdx 2621440 4096 32768 16380 on auto \
             vol1 maxDiscard 1 ack 1 bio 4 bioRotationInterval 64 cpu 2 \
             hash 1 logical 1 physical 1"
        );
    }

    #[test]
    fn parse_round_trips() {
        let table = DmTable::from_record(&record());
        let reparsed = DmTable::parse(&table.to_string()).unwrap();
        assert_eq!(reparsed, table);
    }

    #[test]
    fn modified_fields_survive_reformat() {
        let mut table = DmTable::from_record(&record());
        table.num_sectors = 8 * 1024 * 1024 * 1024 / 512;
        table.write_policy = WritePolicy::Sync;
        let reparsed = DmTable::parse(&table.to_string()).unwrap();
        assert_eq!(reparsed.num_sectors, table.num_sectors);
        assert_eq!(reparsed.write_policy, WritePolicy::Sync);
    }

    #[test]
    fn rejects_foreign_targets() {
        assert!(DmTable::parse("0 100 linear /dev/sdx 0").is_err());
        assert!(
            DmTable::parse("0 100 vdo V1 /dev/sdx 1 4096 1 1 on auto v1")
                .is_err()
        );
    }
}
