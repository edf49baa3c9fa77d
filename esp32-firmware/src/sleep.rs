//! Deep sleep, wake sources and reset.

use esp_idf_sys::{self as sys, esp};
use log::*;
use moe_telemetry::platform::{RestartCause, System};
use moe_telemetry::power::{PinLevel, PowerControl, SleepPlan};

/// The door contact doubles as the ext0 wake source, so it lives here.
pub struct EspPower {
    wake_pin: i32,
}

impl EspPower {
    pub fn new(wake_pin: u8) -> anyhow::Result<Self> {
        let pin = i32::from(wake_pin);
        esp!(unsafe { sys::gpio_reset_pin(pin) })?;
        esp!(unsafe { sys::gpio_set_direction(pin, sys::gpio_mode_t_GPIO_MODE_INPUT) })?;
        esp!(unsafe { sys::gpio_set_pull_mode(pin, sys::gpio_pull_mode_t_GPIO_PULLUP_ONLY) })?;
        Ok(Self { wake_pin: pin })
    }
}

pub fn read_level(pin: i32) -> PinLevel {
    if unsafe { sys::gpio_get_level(pin) } == 0 {
        PinLevel::Low
    } else {
        PinLevel::High
    }
}

impl PowerControl for EspPower {
    fn pin_level(&self, pin: u8) -> PinLevel {
        read_level(i32::from(pin))
    }

    fn power_down(&self, plan: &SleepPlan) {
        let pin = i32::from(plan.wake_pin);
        if pin != self.wake_pin {
            warn!("sleep: waking on GPIO{} which was configured as GPIO{}", pin, self.wake_pin);
        }
        let level = match plan.wake_level {
            PinLevel::Low => 0,
            PinLevel::High => 1,
        };
        let armed = esp!(unsafe { sys::rtc_gpio_pullup_en(pin) })
            .and_then(|_| esp!(unsafe { sys::rtc_gpio_pulldown_dis(pin) }))
            .and_then(|_| esp!(unsafe { sys::esp_sleep_enable_ext0_wakeup(pin, level) }))
            .and_then(|_| {
                esp!(unsafe { sys::esp_sleep_enable_timer_wakeup(plan.timer.as_micros() as u64) })
            })
            .and_then(|_| {
                esp!(unsafe {
                    sys::esp_sleep_pd_config(
                        sys::esp_sleep_pd_domain_t_ESP_PD_DOMAIN_RTC_PERIPH,
                        sys::esp_sleep_pd_option_t_ESP_PD_OPTION_ON,
                    )
                })
            });
        if let Err(e) = armed {
            error!("sleep: arming wake sources failed: {}", e);
        }

        info!("sleep: entering deep sleep");
        unsafe { sys::esp_deep_sleep_start() }
    }
}

pub struct EspSystem;

impl System for EspSystem {
    fn restart(&self, cause: RestartCause) -> ! {
        info!("system: restarting ({:?})", cause);
        unsafe {
            sys::esp_restart();
        }
    }
}
