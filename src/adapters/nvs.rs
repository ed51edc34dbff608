//! NVS (Non-Volatile Storage) adapter.
//!
//! Implements [`ConfigPort`] for the AquaNode controller.  Two records
//! live in the `aquanode` namespace, both postcard-encoded:
//!
//! | Key         | Content                          |
//! |-------------|----------------------------------|
//! | `syscfg`    | [`SystemConfig`]                 |
//! | `actuators` | `Vec<ActuatorConfig>` (≤ 16)     |
//!
//! - Validation: [`SystemConfig::validate`] runs before every save; invalid
//!   ranges are rejected, never clamped.
//! - Atomic writes: ESP-IDF NVS commits are atomic per `nvs_commit()`.
//! - The simulation backend keeps records in memory (dev/test only).

use core::ffi::CStr;

use log::info;

use crate::app::ports::{ConfigPort, StoreError, MAX_ACTUATORS};
use crate::config::SystemConfig;
use crate::drivers::actuator::ActuatorConfig;

#[cfg(target_os = "espidf")]
use esp_idf_svc::sys::*;

#[cfg(not(target_os = "espidf"))]
use std::collections::HashMap;

#[cfg(target_os = "espidf")]
const NAMESPACE: &CStr = c"aquanode";
const CONFIG_KEY: &CStr = c"syscfg";
const ACTUATORS_KEY: &CStr = c"actuators";

const MAX_BLOB_SIZE: usize = 4000;

pub struct NvsAdapter {
    #[cfg(not(target_os = "espidf"))]
    store: std::cell::RefCell<HashMap<&'static CStr, Vec<u8>>>,
}

impl NvsAdapter {
    /// Initialise NVS flash.  On first boot or after a version mismatch the
    /// partition is erased and re-initialised.
    pub fn new() -> Result<Self, StoreError> {
        #[cfg(target_os = "espidf")]
        {
            // SAFETY: called once from the main task before any NVS access.
            let ret = unsafe { nvs_flash_init() };
            if ret == ESP_ERR_NVS_NO_FREE_PAGES as esp_err_t || ret == ESP_ERR_NVS_NEW_VERSION_FOUND as esp_err_t {
                log::warn!("NVS: erasing and re-initialising flash partition");
                // SAFETY: as above.
                if unsafe { nvs_flash_erase() } != ESP_OK as esp_err_t || unsafe { nvs_flash_init() } != ESP_OK as esp_err_t {
                    return Err(StoreError::Io);
                }
            } else if ret != ESP_OK as esp_err_t {
                return Err(StoreError::Io);
            }
            info!("NvsAdapter: ESP-IDF NVS initialised");
        }

        #[cfg(not(target_os = "espidf"))]
        info!("NvsAdapter: simulation backend");

        Ok(Self {
            #[cfg(not(target_os = "espidf"))]
            store: std::cell::RefCell::new(HashMap::new()),
        })
    }

    // ── Raw blob access ───────────────────────────────────────────

    #[cfg(target_os = "espidf")]
    fn with_handle<T>(
        write: bool,
        f: impl FnOnce(nvs_handle_t) -> Result<T, esp_err_t>,
    ) -> Result<T, esp_err_t> {
        let mode = if write {
            nvs_open_mode_t_NVS_READWRITE
        } else {
            nvs_open_mode_t_NVS_READONLY
        };
        let mut handle: nvs_handle_t = 0;
        // SAFETY: NAMESPACE is NUL-terminated; handle is closed below.
        let ret = unsafe { nvs_open(NAMESPACE.as_ptr(), mode, &mut handle) };
        if ret != ESP_OK as esp_err_t {
            return Err(ret);
        }
        let result = f(handle);
        // SAFETY: handle was opened above.
        unsafe { nvs_close(handle) };
        result
    }

    #[cfg(target_os = "espidf")]
    fn read_blob(&self, key: &'static CStr) -> Result<Vec<u8>, StoreError> {
        let result = Self::with_handle(false, |handle| {
            let mut size: usize = 0;
            // SAFETY: size query with a null buffer.
            let ret = unsafe { nvs_get_blob(handle, key.as_ptr(), core::ptr::null_mut(), &mut size) };
            if ret != ESP_OK as esp_err_t {
                return Err(ret);
            }
            if size == 0 || size > MAX_BLOB_SIZE {
                return Err(ESP_ERR_NVS_INVALID_LENGTH as esp_err_t);
            }
            let mut buf = vec![0u8; size];
            // SAFETY: buf holds exactly `size` bytes.
            let ret = unsafe { nvs_get_blob(handle, key.as_ptr(), buf.as_mut_ptr().cast(), &mut size) };
            if ret != ESP_OK as esp_err_t {
                return Err(ret);
            }
            Ok(buf)
        });
        match result {
            Ok(buf) => Ok(buf),
            // Namespace not created yet reads the same as a missing key.
            Err(e) if e == ESP_ERR_NVS_NOT_FOUND as esp_err_t => Err(StoreError::NotFound),
            Err(e) if e == ESP_ERR_NVS_INVALID_LENGTH as esp_err_t => Err(StoreError::Corrupted),
            Err(e) => {
                log::warn!("NvsAdapter: read {:?} failed ({})", key, e);
                Err(StoreError::Io)
            }
        }
    }

    #[cfg(target_os = "espidf")]
    fn write_blob(&self, key: &'static CStr, bytes: &[u8]) -> Result<(), StoreError> {
        let result = Self::with_handle(true, |handle| {
            // SAFETY: key is NUL-terminated; bytes outlives the call.
            let ret = unsafe { nvs_set_blob(handle, key.as_ptr(), bytes.as_ptr().cast(), bytes.len()) };
            if ret != ESP_OK as esp_err_t {
                return Err(ret);
            }
            // SAFETY: handle is open read-write.
            let ret = unsafe { nvs_commit(handle) };
            if ret != ESP_OK as esp_err_t {
                return Err(ret);
            }
            Ok(())
        });
        result.map_err(|e| {
            log::warn!("NvsAdapter: write {:?} failed ({})", key, e);
            if e == ESP_ERR_NVS_NOT_ENOUGH_SPACE as esp_err_t {
                StoreError::Full
            } else {
                StoreError::Io
            }
        })
    }

    #[cfg(not(target_os = "espidf"))]
    fn read_blob(&self, key: &'static CStr) -> Result<Vec<u8>, StoreError> {
        self.store.borrow().get(key).cloned().ok_or(StoreError::NotFound)
    }

    #[cfg(not(target_os = "espidf"))]
    fn write_blob(&self, key: &'static CStr, bytes: &[u8]) -> Result<(), StoreError> {
        self.store.borrow_mut().insert(key, bytes.to_vec());
        Ok(())
    }
}

impl ConfigPort for NvsAdapter {
    fn load(&self) -> Result<SystemConfig, StoreError> {
        let bytes = self.read_blob(CONFIG_KEY)?;
        let cfg: SystemConfig = postcard::from_bytes(&bytes).map_err(|_| StoreError::Corrupted)?;
        cfg.validate().map_err(StoreError::ValidationFailed)?;
        info!("NvsAdapter: loaded system config ({} bytes)", bytes.len());
        Ok(cfg)
    }

    fn save(&mut self, config: &SystemConfig) -> Result<(), StoreError> {
        config.validate().map_err(StoreError::ValidationFailed)?;
        let bytes = postcard::to_allocvec(config).map_err(|_| StoreError::Io)?;
        if bytes.len() > MAX_BLOB_SIZE {
            return Err(StoreError::Full);
        }
        self.write_blob(CONFIG_KEY, &bytes)?;
        info!("NvsAdapter: system config saved ({} bytes)", bytes.len());
        Ok(())
    }

    fn load_actuators(&self) -> Result<heapless::Vec<ActuatorConfig, MAX_ACTUATORS>, StoreError> {
        let bytes = self.read_blob(ACTUATORS_KEY)?;
        let list: Vec<ActuatorConfig> =
            postcard::from_bytes(&bytes).map_err(|_| StoreError::Corrupted)?;
        if list.len() > MAX_ACTUATORS {
            return Err(StoreError::Corrupted);
        }
        Ok(list.into_iter().collect())
    }

    fn save_actuators(&mut self, actuators: &[ActuatorConfig]) -> Result<(), StoreError> {
        if actuators.len() > MAX_ACTUATORS {
            return Err(StoreError::ValidationFailed("too many actuators"));
        }
        let bytes = postcard::to_allocvec(actuators).map_err(|_| StoreError::Io)?;
        if bytes.len() > MAX_BLOB_SIZE {
            return Err(StoreError::Full);
        }
        self.write_blob(ACTUATORS_KEY, &bytes)?;
        info!("NvsAdapter: {} actuator config(s) saved", actuators.len());
        Ok(())
    }
}
