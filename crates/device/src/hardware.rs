//! PC/SC-backed [`Device`](crate::Device) implementation.
//!
//! This is a thin shim over a PIV applet's custom data objects — selecting
//! the applet and issuing `GET DATA`/`PUT DATA` APDUs — not a full PIV card
//! edge implementation. Device enumeration, reader selection and PIN
//! retrieval remain the external collaborator's job; this module only ever
//! receives an already-opened [`pcsc::Card`].

use std::sync::Mutex;

use p256::elliptic_curve::sec1::ToEncodedPoint;
use p256::PublicKey;
use pcsc::{Card, MAX_BUFFER_SIZE};

use crate::{AdminCredential, Device, DeviceHandle, Error, ObjectBytes, Pin, SlotId};

const PIV_AID: [u8; 5] = [0xA0, 0x00, 0x00, 0x03, 0x08];
const SW_SUCCESS: [u8; 2] = [0x90, 0x00];

fn apdu_select_piv() -> Vec<u8> {
    let mut apdu = vec![0x00, 0xA4, 0x04, 0x00, PIV_AID.len() as u8];
    apdu.extend_from_slice(&PIV_AID);
    apdu
}

fn apdu_get_data(slot: SlotId) -> Vec<u8> {
    // 0x5C tag list wrapping the 3-byte data object tag for `slot`.
    let id = slot.0.to_be_bytes();
    vec![0x00, 0xCB, 0x3F, 0xFF, 0x05, 0x5C, 0x03, id[1], id[2], id[3]]
}

fn apdu_put_data(slot: SlotId, payload: &[u8]) -> Result<Vec<u8>, Error> {
    let id = slot.0.to_be_bytes();
    let mut body = vec![0x5C, 0x03, id[1], id[2], id[3], 0x53];
    push_ber_length(&mut body, payload.len());
    body.extend_from_slice(payload);
    if body.len() > 0xFFFF {
        return Err(Error::IoFatal("payload too large for an extended-length APDU".into()));
    }
    let mut apdu = vec![0x00, 0xDB, 0x3F, 0xFF];
    push_ber_length(&mut apdu, body.len());
    apdu.extend_from_slice(&body);
    Ok(apdu)
}

fn push_ber_length(out: &mut Vec<u8>, len: usize) {
    if len < 0x80 {
        out.push(len as u8);
    } else if len <= 0xFF {
        out.push(0x81);
        out.push(len as u8);
    } else {
        out.push(0x82);
        out.extend_from_slice(&(len as u16).to_be_bytes());
    }
}

/// Extract the primitive value of the first `0x53` (or requested) TLV tag
/// from a `GET DATA` response. Minimal BER-TLV reader: enough for PIV's
/// flat, non-nested custom data objects.
fn extract_tlv_value(tag: u8, data: &[u8]) -> Option<&[u8]> {
    let mut i = 0;
    while i < data.len() {
        let t = data[i];
        i += 1;
        if i >= data.len() {
            break;
        }
        let (len, consumed) = match data[i] {
            0x81 if i + 1 < data.len() => (data[i + 1] as usize, 2),
            0x82 if i + 2 < data.len() => {
                (u16::from_be_bytes([data[i + 1], data[i + 2]]) as usize, 3)
            }
            l => (l as usize, 1),
        };
        i += consumed;
        if i + len > data.len() {
            break;
        }
        if t == tag {
            return Some(&data[i..i + len]);
        }
        i += len;
    }
    None
}

/// A connected PC/SC card talking the PIV custom data object protocol.
pub struct PcscDevice {
    handle: DeviceHandle,
    card: Mutex<Card>,
}

impl PcscDevice {
    /// Wrap an already-connected, already-selected-or-selectable card. The
    /// external collaborator is responsible for enumerating readers and
    /// resolving whichever identifier (reader string or serial) it uses to
    /// the opaque `handle` passed here.
    pub fn new(handle: DeviceHandle, card: Card) -> Result<Self, Error> {
        let dev = Self { handle, card: Mutex::new(card) };
        dev.transmit(&apdu_select_piv())?;
        Ok(dev)
    }

    fn transmit(&self, apdu: &[u8]) -> Result<Vec<u8>, Error> {
        let card = self.card.lock().unwrap();
        let mut buf = [0u8; MAX_BUFFER_SIZE];
        let response = card
            .transmit(apdu, &mut buf)
            .map_err(|e| Error::IoFatal(format!("pcsc transmit failed: {e}")))?;
        if response.len() < 2 {
            return Err(Error::IoFatal("short APDU response".into()));
        }
        let (body, sw) = response.split_at(response.len() - 2);
        if sw != SW_SUCCESS {
            return Err(Error::IoTransient(format!(
                "card returned status {:02x}{:02x}",
                sw[0], sw[1]
            )));
        }
        Ok(body.to_vec())
    }
}

impl Device for PcscDevice {
    fn handle(&self) -> &DeviceHandle {
        &self.handle
    }

    fn read_object(&self, slot: SlotId) -> Result<ObjectBytes, Error> {
        match self.transmit(&apdu_get_data(slot)) {
            Ok(body) => match extract_tlv_value(0x53, &body) {
                Some(value) => Ok(ObjectBytes::Data(value.to_vec())),
                None => Ok(ObjectBytes::Empty),
            },
            Err(Error::IoTransient(_)) => Ok(ObjectBytes::Empty),
            Err(e) => Err(e),
        }
    }

    fn write_object(&self, slot: SlotId, bytes: &[u8], _auth: &AdminCredential) -> Result<(), Error> {
        let apdu = apdu_put_data(slot, bytes)?;
        self.transmit(&apdu)?;
        Ok(())
    }

    fn public_key(&self, slot: SlotId) -> Result<[u8; 65], Error> {
        let body = self.transmit(&apdu_get_data(slot))?;
        let point = extract_tlv_value(0x86, &body).ok_or(Error::KeyAbsent)?;
        let public = PublicKey::from_sec1_bytes(point).map_err(|_| Error::KeyAbsent)?;
        let encoded = public.to_encoded_point(false);
        let mut out = [0u8; 65];
        out.copy_from_slice(encoded.as_bytes());
        Ok(out)
    }

    fn ecdh(&self, slot: SlotId, peer_public: &[u8; 65], _pin: &Pin) -> Result<[u8; 32], Error> {
        // GENERAL AUTHENTICATE (0x87 dynamic auth template) requesting a
        // key agreement response (0x82) for the ephemeral point (0x85).
        let id = slot.0.to_be_bytes();
        let mut template = vec![0x7C];
        let mut inner = vec![0x82, 0x00, 0x85];
        push_ber_length(&mut inner, peer_public.len());
        inner.extend_from_slice(peer_public);
        push_ber_length(&mut template, inner.len());
        template.extend_from_slice(&inner);

        let mut apdu = vec![0x00, 0x87, 0x11, id[2]];
        push_ber_length(&mut apdu, template.len());
        apdu.extend_from_slice(&template);

        let body = self.transmit(&apdu)?;
        let outer = extract_tlv_value(0x7C, &body).unwrap_or(&body);
        let secret = extract_tlv_value(0x82, outer).ok_or(Error::KeyAbsent)?;
        if secret.len() != 32 {
            return Err(Error::IoFatal("unexpected shared secret length".into()));
        }
        let mut out = [0u8; 32];
        out.copy_from_slice(secret);
        Ok(out)
    }

    fn auth_admin(&self, credential: &AdminCredential) -> Result<(), Error> {
        // EXTERNAL AUTHENTICATE with the management key. A real deployment
        // runs a challenge/response handshake; the bytes here are assumed
        // to already be the response half, computed by the external
        // collaborator that holds (or unlocked) the management key.
        let bytes = match credential {
            AdminCredential::ManagementKey(b) | AdminCredential::PreAuthorized(b) => b,
        };
        let mut apdu = vec![0x00, 0x88, 0x00, 0x9B];
        push_ber_length(&mut apdu, bytes.len());
        apdu.extend_from_slice(bytes);
        self.transmit(&apdu)?;
        Ok(())
    }
}
