// LNP Node: node running lightning network protocol and generalized lightning
// channels.
// Written in 2020-2022 by
//     Dr. Maxim Orlovsky <orlovsky@pandoracore.com>
//
// To the extent possible under law, the author(s) have dedicated all
// copyright and related and neighboring rights to this software to
// the public domain worldwide. This software is distributed without
// any warranty.
//
// You should have received a copy of the MIT License
// along with this software.
// If not, see <https://opensource.org/licenses/MIT>.

//! Static channel backups: authenticated blobs listing the channels they cover.
//!
//! A blob is a strict-encoded record of a format version, the funding outpoints of the covered
//! channels, an opaque payload and an HMAC-SHA256 code over all the preceding fields. Blobs
//! are accepted only when they decode completely and carry a valid code, so any truncation or
//! modification invalidates them.
//!
//! Only the node holds the backup key, so [`BackupVerifier`] asks the node to check blobs.
//! [`seal`] and [`SealedBackup`] define the blob format the node side implements.

use std::collections::BTreeSet;
use std::io;

use bitcoin::hashes::hmac::{Hmac, HmacEngine};
use bitcoin::hashes::{sha256, Hash, HashEngine};
use bitcoin::Txid;
use ln_rpc::{
    BackupVerification, ChannelBackup, ChannelPoint, MultiBackup, RpcMsg, Subscription, Topic,
    Transport, VerifyBackup, VerifyBackups,
};
use strict_encoding::{StrictDecode, StrictEncode};

/// Version of the backup format produced by [`seal`]
pub const BACKUP_VERSION: u8 = 1;

#[derive(Debug, Display, From, Error)]
#[display(doc_comments)]
pub enum Error {
    /// malformed backup data: {0}
    #[from]
    Encoding(strict_encoding::Error),

    /// backup is followed by {0} bytes of unrelated data
    TrailingData(usize),

    /// backup format version {0} is not supported
    UnsupportedVersion(u8),

    /// backup authentication code does not match its content
    MacMismatch,

    /// backup key must not be empty
    NoKey,
}

#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
#[derive(StrictEncode, StrictDecode)]
struct FundingOutpoint {
    txid: [u8; 32],
    vout: u32,
}

impl From<ChannelPoint> for FundingOutpoint {
    fn from(point: ChannelPoint) -> Self {
        FundingOutpoint { txid: point.transaction_id.into_inner(), vout: point.transaction_vout }
    }
}

impl From<FundingOutpoint> for ChannelPoint {
    fn from(outpoint: FundingOutpoint) -> Self {
        ChannelPoint {
            transaction_id: Txid::from_inner(outpoint.txid),
            transaction_vout: outpoint.vout,
        }
    }
}

/// Decoded and authenticated backup blob
#[derive(Clone, PartialEq, Eq, Hash, Debug)]
#[derive(StrictEncode, StrictDecode)]
pub struct SealedBackup {
    version: u8,
    channels: Vec<FundingOutpoint>,
    payload: Vec<u8>,
    mac: [u8; 32],
}

impl SealedBackup {
    fn authenticated_data(&self) -> Result<Vec<u8>, Error> {
        let mut data = vec![];
        self.version.strict_encode(&mut data)?;
        self.channels.strict_encode(&mut data)?;
        self.payload.strict_encode(&mut data)?;
        Ok(data)
    }

    fn compute_mac(&self, key: &[u8]) -> Result<[u8; 32], Error> {
        let mut engine = HmacEngine::<sha256::Hash>::new(key);
        engine.input(&self.authenticated_data()?);
        Ok(Hmac::<sha256::Hash>::from_engine(engine).into_inner())
    }

    /// Decodes blob and checks its authentication code. Blobs with trailing data are rejected.
    pub fn open(key: &[u8], blob: &[u8]) -> Result<SealedBackup, Error> {
        if key.is_empty() {
            return Err(Error::NoKey);
        }
        let mut cursor = io::Cursor::new(blob);
        let backup = SealedBackup::strict_decode(&mut cursor)?;
        let consumed = cursor.position() as usize;
        if consumed != blob.len() {
            return Err(Error::TrailingData(blob.len() - consumed));
        }
        if backup.version != BACKUP_VERSION {
            return Err(Error::UnsupportedVersion(backup.version));
        }
        if backup.compute_mac(key)? != backup.mac {
            return Err(Error::MacMismatch);
        }
        Ok(backup)
    }

    #[inline]
    pub fn version(&self) -> u8 { self.version }

    /// Channels covered by the backup, in the order they were sealed
    pub fn channels(&self) -> Vec<ChannelPoint> {
        self.channels.iter().copied().map(ChannelPoint::from).collect()
    }

    #[inline]
    pub fn payload(&self) -> &[u8] { &self.payload }

    /// Checks that the backup covers exactly the given set of channels
    pub fn covers(&self, channels: &[ChannelPoint]) -> bool {
        let expected = channels.iter().copied().map(FundingOutpoint::from).collect::<BTreeSet<_>>();
        let sealed = self.channels.iter().copied().collect::<BTreeSet<_>>();
        sealed.len() == self.channels.len() && sealed == expected
    }
}

/// Produces authenticated backup blob covering `channels`
pub fn seal(key: &[u8], channels: &[ChannelPoint], payload: &[u8]) -> Result<Vec<u8>, Error> {
    if key.is_empty() {
        return Err(Error::NoKey);
    }
    let mut backup = SealedBackup {
        version: BACKUP_VERSION,
        channels: channels.iter().copied().map(FundingOutpoint::from).collect(),
        payload: payload.to_vec(),
        mac: [0u8; 32],
    };
    backup.mac = backup.compute_mac(key)?;
    Ok(backup.strict_serialize()?)
}

/// Retrieves channel backups from the node and has the node verify backup blobs
#[derive(Debug)]
pub struct BackupVerifier<T: Transport> {
    transport: T,
}

impl<T: Transport> BackupVerifier<T> {
    pub fn with(transport: T) -> Self { BackupVerifier { transport } }

    /// Checks that `blob` is an authentic backup of exactly the given channel
    pub fn verify_backup(
        &self,
        blob: &[u8],
        channel: ChannelPoint,
    ) -> Result<BackupVerification, crate::Error> {
        let request = RpcMsg::from(VerifyBackup { backup: blob.to_vec(), channel });
        let verification = rpc_call!(
            self.transport, request => RpcMsg::BackupVerification(verification) => verification
        )?;
        debug!("Backup of {}: {}", channel, verification);
        Ok(verification)
    }

    /// Checks that `blob` is an authentic backup of exactly the given set of channels.
    /// A backup missing any channel, or covering any other one, is invalid as a whole.
    pub fn verify_backups(
        &self,
        blob: &[u8],
        channels: &[ChannelPoint],
    ) -> Result<BackupVerification, crate::Error> {
        let request =
            RpcMsg::from(VerifyBackups { backup: blob.to_vec(), channels: channels.to_vec() });
        let verification = rpc_call!(
            self.transport, request => RpcMsg::BackupVerification(verification) => verification
        )?;
        debug!("Backup of {} channels: {}", channels.len(), verification);
        Ok(verification)
    }

    pub fn get_backup(&self, channel: ChannelPoint) -> Result<ChannelBackup, crate::Error> {
        rpc_call!(self.transport, RpcMsg::GetBackup(channel) => RpcMsg::Backup(backup) => backup)
    }

    pub fn get_backups(&self) -> Result<MultiBackup, crate::Error> {
        rpc_call!(self.transport, RpcMsg::GetBackups => RpcMsg::Backups(backups) => backups)
    }

    /// Stream of refreshed backups, emitted by the node whenever the channel set changes
    pub fn subscribe_to_backups(&self) -> Result<Subscription, crate::Error> {
        Ok(self.transport.subscribe(Topic::Backups)?)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    const KEY: &[u8] = b"channel backup key";

    fn point(seed: u8, vout: u32) -> ChannelPoint {
        ChannelPoint { transaction_id: Txid::from_inner([seed; 32]), transaction_vout: vout }
    }

    #[test]
    fn sealed_backup_opens() {
        let blob = seal(KEY, &[point(1, 0), point(2, 1)], b"payload").unwrap();
        let backup = SealedBackup::open(KEY, &blob).unwrap();
        assert_eq!(backup.version(), BACKUP_VERSION);
        assert_eq!(backup.channels(), vec![point(1, 0), point(2, 1)]);
        assert_eq!(backup.payload(), b"payload");
        assert!(backup.covers(&[point(2, 1), point(1, 0)]));
        assert!(!backup.covers(&[point(1, 0)]));
        assert!(!backup.covers(&[point(1, 0), point(2, 1), point(3, 0)]));
    }

    #[test]
    fn any_truncation_invalidates() {
        let blob = seal(KEY, &[point(1, 0)], &[0xAB; 64]).unwrap();
        for len in 0..blob.len() {
            assert!(SealedBackup::open(KEY, &blob[..len]).is_err(), "prefix of {} bytes", len);
            assert!(SealedBackup::open(KEY, &blob[blob.len() - len..]).is_err());
        }
        let mut extended = blob.clone();
        extended.push(0);
        assert!(matches!(SealedBackup::open(KEY, &extended), Err(Error::TrailingData(1))));
        extended.extend_from_slice(&blob);
        assert!(matches!(
            SealedBackup::open(KEY, &extended),
            Err(Error::TrailingData(len)) if len == blob.len() + 1
        ));
    }

    #[test]
    fn foreign_key_and_tampering_are_detected() {
        let blob = seal(KEY, &[point(1, 0)], b"state").unwrap();
        assert!(matches!(SealedBackup::open(b"other key", &blob), Err(Error::MacMismatch)));

        let mut tampered = blob.clone();
        let last = tampered.len() - 40;
        tampered[last] ^= 1;
        assert!(SealedBackup::open(KEY, &tampered).is_err());

        assert!(matches!(seal(b"", &[], b""), Err(Error::NoKey)));
    }
}
