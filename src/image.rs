//! Process image dispatch
//!
//! A slave decides whether a frame is addressed to it by asking its
//! [`RequestListener`] for the process image of the frame's unit id. What a
//! function code means to the device is left to the [`ProcessImage`].

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;
use log::{debug, warn};

use crate::error::ModbusResult;
use crate::protocol::{Frame, ModbusException};
use crate::transport::Transport;

/// Application-side register and coil state for one unit
#[async_trait]
pub trait ProcessImage: Send + Sync {
    /// Produce the response for a request addressed to this image
    ///
    /// Failures are reported in-band as exception responses.
    async fn process(&self, request: &Frame) -> Frame;
}

/// Resolves the process image a unit id is served by
pub trait RequestListener: Send + Sync {
    fn process_image(&self, unit_id: u8) -> Option<Arc<dyn ProcessImage>>;
}

/// Unit id to process image table shared by a slave and its connections
#[derive(Clone, Default)]
pub struct UnitMap {
    units: Arc<RwLock<HashMap<u8, Arc<dyn ProcessImage>>>>,
    fallback: Arc<RwLock<Option<Arc<dyn ProcessImage>>>>,
}

// A poisoned table is still consistent; recover it
fn read_table<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|poisoned| {
        warn!("Unit map lock poisoned, recovering");
        PoisonError::into_inner(poisoned)
    })
}

fn write_table<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|poisoned| {
        warn!("Unit map lock poisoned, recovering");
        PoisonError::into_inner(poisoned)
    })
}

impl UnitMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Map serving every unit id from one image
    pub fn with_default(image: Arc<dyn ProcessImage>) -> Self {
        let map = Self::new();
        map.set_default(Some(image));
        map
    }

    pub fn insert(&self, unit_id: u8, image: Arc<dyn ProcessImage>) {
        write_table(&self.units).insert(unit_id, image);
    }

    pub fn remove(&self, unit_id: u8) -> Option<Arc<dyn ProcessImage>> {
        write_table(&self.units).remove(&unit_id)
    }

    /// Image for unit ids without their own entry
    pub fn set_default(&self, image: Option<Arc<dyn ProcessImage>>) {
        *write_table(&self.fallback) = image;
    }

    pub fn unit_ids(&self) -> Vec<u8> {
        let mut ids: Vec<u8> = read_table(&self.units).keys().copied().collect();
        ids.sort_unstable();
        ids
    }
}

impl RequestListener for UnitMap {
    fn process_image(&self, unit_id: u8) -> Option<Arc<dyn ProcessImage>> {
        let image = read_table(&self.units).get(&unit_id).cloned();
        image.or_else(|| read_table(&self.fallback).clone())
    }
}

/// One decode, dispatch and encode cycle
///
/// Frames for units without an image only reach this point over TCP, where
/// they are answered with exception 0x0B. Serial broadcasts (unit 0) are
/// processed without a reply.
pub async fn handle_request(transport: &mut Transport, listener: &dyn RequestListener) -> ModbusResult<()> {
    let request = transport.read_request(listener).await?;

    let response = match listener.process_image(request.unit_id) {
        Some(image) => image.process(&request).await,
        None => {
            debug!("No process image for unit {}", request.unit_id);
            request.exception_reply(ModbusException::GatewayTargetDeviceFailedToRespond)
        }
    };

    if request.unit_id == 0 && transport.codec().is_serial() {
        return Ok(());
    }
    transport.write_response(&response).await
}
