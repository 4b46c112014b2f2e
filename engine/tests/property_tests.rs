use proptest::prelude::*;
use evolver_engine::config::{Config, DilutionConfig};
use evolver_engine::controls::{
    adjust_bolus_rate, compute_bolus_volume, CalibrationExchange, EvolverControls,
};
use evolver_engine::daemon::fluids::FluidInventory;
use evolver_engine::device::{DeviceConnector, LoopbackConnector, LoopbackDevice};
use evolver_engine::manager::{wall_clock, FluidUpdate};
use evolver_engine::protocol::{decode_frame, encode_frame};
use evolver_engine::reactor::filters::median;
use evolver_engine::reactor::{
    BaseSettings, Bioreactor, FluidUsage, ReactorKind, ReactorSpec, RecurringUsage,
    TurbidostatState,
};
use evolver_engine::staging::FragmentName;
use sdk::device::{Broadcast, CalibrationBundle, PumpChannel};
use sdk::types::Request;
use serde_json::json;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

fn controls(num_vials: usize) -> (EvolverControls, Arc<LoopbackDevice>) {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .build()
        .unwrap();
    let connector = LoopbackConnector::new();
    let channel = runtime.block_on(connector.attach("http://unit")).unwrap();
    let device = connector.device("http://unit").unwrap();
    let controls = EvolverControls::new(
        channel.link,
        num_vials,
        DilutionConfig::default(),
        Arc::new(CalibrationExchange::new()),
        Duration::from_millis(100),
    );
    (controls, device)
}

proptest! {
    #[test]
    fn test_request_frame_round_trip(
        command in "[a-z_]{1,16}",
        args in prop::collection::btree_map("[a-z]{1,8}", -1.0e6..1.0e6f64, 0..6),
    ) {
        let request = args.iter().fold(Request::new(command), |request, (key, value)| {
            request.with_arg(key.clone(), json!(value))
        });
        let frame = encode_frame(&request).unwrap();
        let body_len = u32::from_be_bytes([frame[0], frame[1], frame[2], frame[3]]) as usize;
        prop_assert_eq!(body_len, frame.len() - 4);

        let decoded: Request = decode_frame(&frame).unwrap();
        prop_assert_eq!(decoded, request);
    }

    #[test]
    fn test_truncated_frame_is_rejected(command in "[a-z]{1,16}", cut in 1usize..8) {
        let frame = encode_frame(&Request::new(command)).unwrap();
        let cut = cut.min(frame.len() - 1);
        prop_assert!(decode_frame::<Request>(&frame[..frame.len() - cut]).is_err());
    }
}

proptest! {
    #[test]
    fn test_adjusted_bolus_rate_is_deliverable(
        bolus in 0.01..20.0f64,
        rate in 0.01..5.0f64,
        volume in 5.0..40.0f64,
    ) {
        let cfg = DilutionConfig::default();
        if let Ok(adjusted) = adjust_bolus_rate(bolus, rate, volume, &cfg) {
            prop_assert!(adjusted.bolus >= cfg.bolus_volume_min - 1e-9);
            prop_assert!(adjusted.bolus <= cfg.bolus_repeat_max + 1e-9);
            prop_assert!(adjusted.period(volume, &cfg) >= cfg.min_pump_period * (1.0 - 1e-9));
            if !adjusted.adjusted {
                prop_assert_eq!(adjusted.bolus, bolus);
                prop_assert_eq!(adjusted.rate, rate);
            }
        }
    }

    #[test]
    fn test_bolus_volume_is_zero_or_within_limits(
        current in 0.0..3.0f64,
        lower in 0.05..1.0f64,
        span in 0.01..1.0f64,
        steps in 0u32..20,
        volume in 5.0..40.0f64,
    ) {
        let cfg = DilutionConfig::default();
        let bolus = compute_bolus_volume(current, lower + span, lower, steps, volume, &cfg);
        prop_assert!(
            bolus == 0.0 || (cfg.bolus_volume_min..=cfg.bolus_volume_max).contains(&bolus),
            "bolus {} out of range", bolus
        );
        if current <= lower {
            prop_assert_eq!(bolus, 0.0);
        }
    }

    #[test]
    fn test_median_lies_within_finite_values(
        values in prop::collection::vec(prop_oneof![4 => -10.0..10.0f64, 1 => Just(f64::NAN)], 1..15),
    ) {
        let finite: Vec<f64> = values.iter().copied().filter(|v| v.is_finite()).collect();
        let m = median(&values);
        if finite.is_empty() {
            prop_assert!(m.is_nan());
        } else {
            let lo = finite.iter().copied().fold(f64::INFINITY, f64::min);
            let hi = finite.iter().copied().fold(f64::NEG_INFINITY, f64::max);
            prop_assert!(lo <= m && m <= hi);
        }
    }
}

proptest! {
    #[test]
    fn test_recurring_draws_charge_whole_periods(
        bolus in 1u32..5,
        period in 10u32..500,
        steps in prop::collection::vec(1u32..2_000, 1..10),
    ) {
        let url = "http://unit";
        let mut inventory = FluidInventory::new();
        let key = BTreeMap::from([(0, BTreeMap::from([(PumpChannel::In1, "media".to_string())]))]);
        inventory.register(url, &key);
        inventory.refill(&HashMap::from([("media".to_string(), 1.0e6)]));

        let mut usage = FluidUsage::default();
        usage.recurring.entry(0).or_default().insert(
            PumpChannel::In1,
            RecurringUsage { bolus: f64::from(bolus), period: f64::from(period) },
        );
        let t0 = 1_000.0;
        inventory.apply(&FluidUpdate { url: url.to_string(), time: t0, usage }, t0);

        // the half-second offset keeps every pass off a period boundary
        let mut now = t0 + 0.5;
        for step in &steps {
            now += f64::from(*step);
            inventory.advance(now);
        }

        let periods = ((now - t0) / f64::from(period)).floor();
        let expected = 1.0e6 - periods * f64::from(bolus);
        prop_assert_eq!(inventory.volume("media"), Some(expected));
    }

    #[test]
    fn test_fragment_name_round_trip(
        experiment in "[a-z0-9_][a-z0-9_.-]{0,20}",
        mode in "[a-z]{1,12}",
        tick in any::<u64>(),
    ) {
        let name = FragmentName::new(experiment, mode, tick);
        prop_assert_eq!(FragmentName::parse(&name.to_string()), Some(name));
    }
}

proptest! {
    #[test]
    fn test_config_toml_round_trip(
        log_level in "error|warn|info|debug|trace",
        port in 1024u16..65535,
        cycle_secs in 0.5..30.0f64,
        idle_cycles in 1u32..100,
        num_vials in 1usize..32,
    ) {
        let mut config = Config::default();
        config.core.log_level = log_level.clone();
        config.daemon.port = port;
        config.daemon.cycle_secs = cycle_secs;
        config.daemon.idle_cycles = idle_cycles;
        config.device.num_vials = num_vials;
        config.alerts.custodians.insert("media".to_string(), vec!["lab@example.org".to_string()]);

        let serialized = toml::to_string_pretty(&config).unwrap();
        let parsed: Config = toml::from_str(&serialized).unwrap();

        prop_assert_eq!(parsed.core.log_level, log_level);
        prop_assert_eq!(parsed.daemon.port, port);
        prop_assert_eq!(parsed.daemon.cycle_secs, cycle_secs);
        prop_assert_eq!(parsed.daemon.idle_cycles, idle_cycles);
        prop_assert_eq!(parsed.device.num_vials, num_vials);
        prop_assert_eq!(parsed.dilution, config.dilution);
        prop_assert_eq!(
            parsed.alerts.custodians.get("media"),
            Some(&vec!["lab@example.org".to_string()])
        );
    }
}

#[derive(Debug, Clone)]
enum FluidStep {
    Dose { vial: usize, inflow: usize, amount: u32 },
    Schedule { vial: usize, inflow: usize, bolus: u32, period: u32 },
    Wait(u32),
}

fn fluid_step() -> impl Strategy<Value = FluidStep> {
    prop_oneof![
        (0usize..2, 0usize..2, 1u32..10)
            .prop_map(|(vial, inflow, amount)| FluidStep::Dose { vial, inflow, amount }),
        (0usize..2, 0usize..2, 1u32..5, 10u32..200).prop_map(|(vial, inflow, bolus, period)| {
            FluidStep::Schedule { vial, inflow, bolus, period }
        }),
        (1u32..500).prop_map(FluidStep::Wait),
    ]
}

proptest! {
    #[test]
    fn test_inventory_decrease_matches_consumption(
        steps in prop::collection::vec(fluid_step(), 1..40),
    ) {
        let url = "http://unit";
        let inflow = [PumpChannel::In1, PumpChannel::In2];
        // vial 1 has nothing on its second inflow
        let keyed = |vial: usize, channel: usize| vial == 0 || channel == 0;

        let mut inventory = FluidInventory::new();
        let key = BTreeMap::from([
            (0, BTreeMap::from([
                (PumpChannel::In1, "media".to_string()),
                (PumpChannel::In2, "drug".to_string()),
            ])),
            (1, BTreeMap::from([(PumpChannel::In1, "media".to_string())])),
        ]);
        inventory.register(url, &key);
        inventory.refill(&HashMap::from([
            ("media".to_string(), 1.0e6),
            ("drug".to_string(), 1.0e6),
        ]));
        let total = |inventory: &FluidInventory| {
            inventory.volume("media").unwrap() + inventory.volume("drug").unwrap()
        };
        let initial = total(&inventory);

        // (installed at, bolus, period, periods charged so far)
        let mut schedules: BTreeMap<(usize, usize), (f64, f64, f64, f64)> = BTreeMap::new();
        let mut drawn = 0.0;
        let mut now = 1_000.0;
        for step in &steps {
            match *step {
                FluidStep::Dose { vial, inflow: channel, amount } => {
                    let mut usage = FluidUsage::default();
                    usage.single.entry(vial).or_default().insert(inflow[channel], f64::from(amount));
                    inventory.apply(&FluidUpdate { url: url.to_string(), time: now, usage }, now);
                    if keyed(vial, channel) {
                        drawn += f64::from(amount);
                    }
                }
                FluidStep::Schedule { vial, inflow: channel, bolus, period } => {
                    // a quarter second off the clock so no pass lands on a period boundary
                    let installed = now + 0.25;
                    let mut usage = FluidUsage::default();
                    usage.recurring.entry(vial).or_default().insert(
                        inflow[channel],
                        RecurringUsage { bolus: f64::from(bolus), period: f64::from(period) },
                    );
                    inventory.apply(
                        &FluidUpdate { url: url.to_string(), time: installed, usage },
                        installed,
                    );
                    if keyed(vial, channel) {
                        schedules.insert(
                            (vial, channel),
                            (installed, f64::from(bolus), f64::from(period), 0.0),
                        );
                    }
                }
                FluidStep::Wait(seconds) => {
                    now += f64::from(seconds);
                    inventory.advance(now);
                    for (installed, bolus, period, charged) in schedules.values_mut() {
                        let whole = ((now - *installed) / *period).floor();
                        drawn += (whole - *charged) * *bolus;
                        *charged = whole;
                    }
                }
            }
        }

        prop_assert_eq!(initial - total(&inventory), drawn);
    }
}

fn slot_token() -> impl Strategy<Value = (usize, usize, String)> {
    (0usize..4, 0usize..3, "[0-9]{1,2}\\.[0-9]{1,2}")
}

proptest! {
    #[test]
    fn test_last_write_wins_within_a_tick(
        writes in prop::collection::vec(slot_token(), 1..30),
    ) {
        let (mut controls, device) = controls(4);
        let mut expected = vec!["--".to_string(); 12];
        for (vial, channel, token) in &writes {
            let channel = PumpChannel::from_index(*channel).unwrap();
            controls.fluid_command(&[(*vial, channel, token.clone())], false);
            expected[channel.index() * 4 + vial] = token.clone();
        }
        prop_assert_eq!(controls.dispatch_queues().unwrap(), 1);

        let commands = device.commands();
        prop_assert_eq!(commands.len(), 1);
        prop_assert_eq!(&commands[0].value, &expected);
        prop_assert!(commands[0].immediate);
    }
}

fn identity_calibration() -> CalibrationBundle {
    serde_json::from_value(json!({
        "od": {"type": "linear", "params": ["od_90"], "coefficients": [[0.0, 1.0]]},
        "temp": {"type": "linear", "params": ["temp"], "coefficients": [[0.0, 1.0]]},
        "pump": {"type": "constant", "coefficients": [[1.0], [1.0], [1.0]]}
    }))
    .unwrap()
}

fn od_broadcast(od: f64) -> Broadcast {
    serde_json::from_value(json!({
        "data": {"od_90": [od], "temp": [30.0]},
        "config": {"temp": {"value": ["30"]}}
    }))
    .unwrap()
}

proptest! {
    #[test]
    fn test_turbidostat_budget_only_counts_down(
        budget in 1u32..4,
        readings in prop::collection::vec(0.05..1.0f64, 1..60),
    ) {
        let (mut controls, _device) = controls(1);
        let base: BaseSettings = serde_json::from_value(json!({
            "vials": [0],
            "volumes": 25.0,
            "mem_len": 3,
            "temp": 30.0,
            "stir": 8,
            "power": 4095
        }))
        .unwrap();
        let special = json!({
            "lower_thresh": 0.2,
            "upper_thresh": 0.5,
            "n_cycles": budget
        });
        let calibration = identity_calibration();
        let born = wall_clock();
        let mut reactor = Bioreactor::build(
            ReactorSpec {
                name: "turbido",
                mode: "turbidostat",
                base: &base,
                special: &special,
                calibration: &calibration,
            },
            1,
            &DilutionConfig::default(),
            born,
        )
        .unwrap();

        let observe = |reactor: &Bioreactor| match reactor.kind() {
            ReactorKind::Turbidostat(t) => (t.state(0), t.dilutions_remaining(0)),
            _ => unreachable!(),
        };
        let (mut state, mut remaining) = observe(&reactor);
        prop_assert_eq!(remaining, Some(budget));

        for (tick, od) in readings.iter().enumerate() {
            let now = born + 60.0 + tick as f64 * 20.0;
            reactor.update(&od_broadcast(*od), now, &mut controls);
            let (next_state, next_remaining) = observe(&reactor);

            let (before, after) = (remaining.unwrap_or(0), next_remaining.unwrap_or(0));
            prop_assert!(after <= before);
            if after < before {
                prop_assert_eq!(before - after, 1);
                prop_assert_eq!(state, TurbidostatState::Growth);
                prop_assert_eq!(next_state, TurbidostatState::Diluting);
            }
            if state == TurbidostatState::Halted {
                prop_assert_eq!(next_state, TurbidostatState::Halted);
            }
            state = next_state;
            remaining = next_remaining;
        }
    }
}
