use robolink_protocol::{
    encode_message, simple_frame, Command, Keyframe, SaveKeyframe, POSITION_BIAS,
};

fn dump(label: &str, bytes: &[u8]) {
    print!("{:14}", label);
    for b in bytes {
        print!(" {:02x}", b);
    }
    println!();
}

fn main() {
    dump("init", &simple_frame(Command::Init));
    dump("stop", &simple_frame(Command::Stop));

    let save = SaveKeyframe {
        index: 1,
        keyframe: Keyframe {
            duration: 1500,
            ticks: [POSITION_BIAS + 580; 8],
            output_command: 0,
        },
    };
    let mut raw = [0u8; 64];
    let len = encode_message(Command::SaveKeyframe, &save, &mut raw).unwrap();
    dump("save_keyframe", &raw[..len]);
}
