//! WMI process-creation subscription.
//!
//! The worker thread enters an STA, subscribes to
//! `__InstanceCreationEvent` for `Win32_Process` through an unsecured
//! apartment stub, and pumps messages until the stop event fires. WMI
//! delivers `Indicate` calls through that message pump.

use crate::error::{HideError, HideResult};
use crate::procinfo;
use crate::watcher::{NotificationSink, ProcessEventSource, ProcessNotification, StopSignal};
use log::{debug, info};
use windows::core::{implement, w, Interface, IUnknown, BSTR, HRESULT, PCWSTR, VARIANT};
use windows::Win32::Foundation::{FALSE, HWND, RPC_E_TOO_LATE, WAIT_FAILED, WAIT_OBJECT_0};
use windows::Win32::Security::PSECURITY_DESCRIPTOR;
use windows::Win32::System::Com::{
    CoCreateInstance, CoInitializeEx, CoInitializeSecurity, CoSetProxyBlanket, CoUninitialize,
    CLSCTX_INPROC_SERVER, CLSCTX_LOCAL_SERVER, COINIT_APARTMENTTHREADED, EOAC_NONE,
    RPC_C_AUTHN_LEVEL_CALL, RPC_C_AUTHN_LEVEL_DEFAULT, RPC_C_IMP_LEVEL_IMPERSONATE,
};
use windows::Win32::System::Wmi::{
    IUnsecuredApartment, IWbemClassObject, IWbemLocator, IWbemObjectSink, IWbemObjectSink_Impl,
    IWbemServices, UnsecuredApartment, WbemLocator, WBEM_E_CALL_CANCELLED,
    WBEM_FLAG_SEND_STATUS, WBEM_STATUS_COMPLETE,
};
use windows::Win32::System::Threading::INFINITE;
use windows::Win32::UI::WindowsAndMessaging::{
    DispatchMessageW, MsgWaitForMultipleObjects, PeekMessageW, TranslateMessage, MSG, PM_REMOVE,
    QS_ALLINPUT,
};

const NAMESPACE: &str = "ROOT\\CIMV2";
const QUERY: &str =
    "SELECT * FROM __InstanceCreationEvent WITHIN 1 WHERE TargetInstance ISA 'Win32_Process'";

const RPC_C_AUTHN_WINNT: u32 = 10;
const RPC_C_AUTHZ_NONE: u32 = 0;

fn failed(what: &str, e: windows::core::Error) -> HideError {
    HideError::SubscriptionFailed(format!("{}: 0x{:08x}", what, e.code().0 as u32))
}

// ============================================================================
// Event sink
// ============================================================================

#[implement(IWbemObjectSink)]
struct CreationSink {
    sink: NotificationSink,
}

fn property(object: &IWbemClassObject, name: PCWSTR) -> Option<VARIANT> {
    let mut value = VARIANT::default();
    unsafe { object.Get(name, 0, &mut value, None, None) }.ok()?;
    Some(value)
}

fn string_property(object: &IWbemClassObject, name: PCWSTR) -> Option<String> {
    property(object, name)
        .and_then(|v| BSTR::try_from(&v).ok())
        .map(|s| s.to_string())
        .filter(|s| !s.is_empty())
}

/// Reads `TargetInstance.{ProcessId, Name, ExecutablePath}`. `None` when
/// the event carries no usable instance or pid.
fn read_notification(event: &IWbemClassObject) -> Option<ProcessNotification> {
    let target = property(event, w!("TargetInstance"))?;
    let instance: IWbemClassObject = IUnknown::try_from(&target).ok()?.cast().ok()?;

    let pid = property(&instance, w!("ProcessId")).and_then(|v| u32::try_from(&v).ok())?;
    let name = string_property(&instance, w!("Name"));
    let path = string_property(&instance, w!("ExecutablePath"));

    Some(ProcessNotification::with_fallbacks(pid, name, path, |pid| {
        procinfo::executable_path(pid).map(|p| p.to_string_lossy().into_owned())
    }))
}

impl IWbemObjectSink_Impl for CreationSink_Impl {
    fn Indicate(
        &self,
        lobjectcount: i32,
        apobjarray: *const Option<IWbemClassObject>,
    ) -> windows::core::Result<()> {
        if apobjarray.is_null() || lobjectcount <= 0 {
            return Ok(());
        }
        // SAFETY: WMI passes `lobjectcount` valid entries.
        let events = unsafe { std::slice::from_raw_parts(apobjarray, lobjectcount as usize) };
        for event in events.iter().flatten() {
            match read_notification(event) {
                Some(notification) => self.sink.process_created(notification),
                None => debug!("[wmi] Skipping event without a process instance"),
            }
        }
        Ok(())
    }

    fn SetStatus(
        &self,
        lflags: i32,
        hresult: HRESULT,
        _strparam: &BSTR,
        _pobjparam: Option<&IWbemClassObject>,
    ) -> windows::core::Result<()> {
        if lflags == WBEM_STATUS_COMPLETE.0
            && hresult.is_err()
            && hresult.0 != WBEM_E_CALL_CANCELLED.0
        {
            self.sink.error(format!(
                "Event subscription ended: 0x{:08x}",
                hresult.0 as u32
            ));
        }
        Ok(())
    }
}

// ============================================================================
// COM plumbing
// ============================================================================

/// STA membership of the current thread, left on drop.
struct Apartment;

impl Apartment {
    fn enter() -> HideResult<Self> {
        unsafe { CoInitializeEx(None, COINIT_APARTMENTTHREADED) }
            .ok()
            .map_err(|e| failed("Failed to initialize COM", e))?;
        let apartment = Apartment;

        let security = unsafe {
            CoInitializeSecurity(
                PSECURITY_DESCRIPTOR::default(),
                -1,
                None,
                None,
                RPC_C_AUTHN_LEVEL_DEFAULT,
                RPC_C_IMP_LEVEL_IMPERSONATE,
                None,
                EOAC_NONE,
                None,
            )
        };
        match security {
            Ok(()) => {}
            // Someone in this process already chose the security settings.
            Err(e) if e.code() == RPC_E_TOO_LATE => {}
            Err(e) => return Err(failed("Failed to initialize security", e)),
        }
        Ok(apartment)
    }
}

impl Drop for Apartment {
    fn drop(&mut self) {
        unsafe { CoUninitialize() };
    }
}

/// A live async query. Field order is release order.
struct Subscription {
    stub: IWbemObjectSink,
    _apartment: IUnsecuredApartment,
    services: IWbemServices,
    _locator: IWbemLocator,
}

impl Subscription {
    fn open(sink: NotificationSink) -> HideResult<Self> {
        let locator: IWbemLocator =
            unsafe { CoCreateInstance(&WbemLocator, None, CLSCTX_INPROC_SERVER) }
                .map_err(|e| failed("Failed to create IWbemLocator", e))?;

        let empty = BSTR::new();
        let services = unsafe {
            locator.ConnectServer(&BSTR::from(NAMESPACE), &empty, &empty, &empty, 0, &empty, None)
        }
        .map_err(|e| failed("Failed to connect to WMI", e))?;

        unsafe {
            CoSetProxyBlanket(
                &services,
                RPC_C_AUTHN_WINNT,
                RPC_C_AUTHZ_NONE,
                PCWSTR::null(),
                RPC_C_AUTHN_LEVEL_CALL,
                RPC_C_IMP_LEVEL_IMPERSONATE,
                None,
                EOAC_NONE,
            )
        }
        .map_err(|e| failed("Failed to set proxy blanket", e))?;

        let apartment: IUnsecuredApartment =
            unsafe { CoCreateInstance(&UnsecuredApartment, None, CLSCTX_LOCAL_SERVER) }
                .map_err(|e| failed("Failed to create unsecured apartment", e))?;

        let local: IWbemObjectSink = CreationSink { sink }.into();
        let stub: IWbemObjectSink = unsafe { apartment.CreateObjectStub(&local) }
            .and_then(|unknown| unknown.cast())
            .map_err(|e| failed("Failed to create object stub", e))?;

        unsafe {
            services.ExecNotificationQueryAsync(
                &BSTR::from("WQL"),
                &BSTR::from(QUERY),
                WBEM_FLAG_SEND_STATUS,
                None,
                &stub,
            )
        }
        .map_err(|e| failed("Failed to register for process events", e))?;

        Ok(Self {
            stub,
            _apartment: apartment,
            services,
            _locator: locator,
        })
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Err(e) = unsafe { self.services.CancelAsyncCall(&self.stub) } {
            debug!("[wmi] CancelAsyncCall: {}", e);
        }
    }
}

/// Dispatches COM messages until `stop` is signalled.
fn pump(stop: &StopSignal) -> HideResult<()> {
    let handles = [stop.event_handle()];
    loop {
        let woke = unsafe {
            MsgWaitForMultipleObjects(Some(&handles), FALSE, INFINITE, QS_ALLINPUT)
        };
        if woke == WAIT_OBJECT_0 {
            debug!("[wmi] Stop requested");
            return Ok(());
        }
        if woke.0 == WAIT_OBJECT_0.0 + 1 {
            let mut msg = MSG::default();
            while unsafe { PeekMessageW(&mut msg, HWND::default(), 0, 0, PM_REMOVE) }.as_bool() {
                unsafe {
                    let _ = TranslateMessage(&msg);
                    DispatchMessageW(&msg);
                }
            }
            continue;
        }
        if woke == WAIT_FAILED {
            return Err(HideError::SubscriptionFailed(format!(
                "MsgWaitForMultipleObjects failed: {}",
                std::io::Error::last_os_error()
            )));
        }
        debug!("[wmi] Unexpected wait result {}", woke.0);
    }
}

// ============================================================================
// Source
// ============================================================================

/// Process-creation notifications from WMI.
#[derive(Debug, Clone, Copy, Default)]
pub struct WmiProcessSource;

impl ProcessEventSource for WmiProcessSource {
    fn run(&mut self, sink: &NotificationSink, stop: &StopSignal) -> HideResult<()> {
        let _apartment = Apartment::enter()?;
        let subscription = Subscription::open(sink.clone())?;
        sink.ready();
        info!("[wmi] Listening for process creation");

        let result = pump(stop);
        drop(subscription);
        result
    }
}
