use std::{net::IpAddr, time::Duration};

use smtp_admission::{shutdown_channel, Admission, AdmissionError, Window};

#[test]
fn per_ip_connection_cap_refuses_extra_connections() {
    let (_trigger, token) = shutdown_channel();
    let admission = Admission::new(1000, 2, 1000, Window::Minute, token);
    let ip: IpAddr = "203.0.113.7".parse().unwrap();

    let first = admission.try_admit(ip).expect("first connection admitted");
    let second = admission.try_admit(ip).expect("second connection admitted");

    match admission.try_admit(ip) {
        Err(AdmissionError::TooManyConnections(got)) => assert_eq!(got, ip),
        other => panic!("expected TooManyConnections, got {:?}", other),
    }

    // Releasing one frees a slot for the next connection.
    admission.release(first);
    admission
        .try_admit(ip)
        .expect("connection admitted after a release");
    admission.release(second);
}

#[test]
fn rate_limit_is_tracked_per_key() {
    let (_trigger, token) = shutdown_channel();
    let admission = Admission::new(1000, 100, 2, Window::Custom(Duration::from_secs(60)), token);
    let a: IpAddr = "198.51.100.1".parse().unwrap();
    let b: IpAddr = "198.51.100.2".parse().unwrap();

    let acquired_a1 = admission.try_admit(a).unwrap();
    let acquired_a2 = admission.try_admit(a).unwrap();
    match admission.try_admit(a) {
        Err(AdmissionError::RateLimited { ip, limit, .. }) => {
            assert_eq!(ip, a);
            assert_eq!(limit, 2);
        }
        other => panic!("expected RateLimited, got {:?}", other),
    }

    // A different key has its own independent budget.
    let acquired_b = admission.try_admit(b).expect("other key unaffected");

    admission.release(acquired_a1);
    admission.release(acquired_a2);
    admission.release(acquired_b);
}
